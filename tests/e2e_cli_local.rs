use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn run_autofill_with_env(dir: &TempDir, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_autofill"));
    command
        .env("AUTOFILL_DIR", dir.path())
        .env_remove("AUTOFILL_PRESENCE_COMMAND")
        .env_remove("AUTOFILLD_SOCKET")
        .args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("failed to run autofill binary")
}

fn run_ok_json_with_env(dir: &TempDir, args: &[&str], envs: &[(&str, &str)]) -> Value {
    let output = run_autofill_with_env(dir, args, envs);
    assert!(
        output.status.success(),
        "command failed: autofill {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout should be valid JSON")
}

fn run_ok_json(dir: &TempDir, args: &[&str]) -> Value {
    run_ok_json_with_env(dir, args, &[])
}

fn run_err_text(dir: &TempDir, args: &[&str]) -> String {
    let output = run_autofill_with_env(dir, args, &[]);
    assert!(
        !output.status.success(),
        "command unexpectedly succeeded: autofill {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn add_account(dir: &TempDir, name: &str, username: &str) -> String {
    let created = run_ok_json(
        dir,
        &["accounts", "add", "--name", name, "--username", username],
    );
    created["id"].as_str().expect("account id").to_string()
}

fn add_mapping(dir: &TempDir, pattern: &str, account: &str) -> String {
    let created = run_ok_json(
        dir,
        &["mappings", "add", "--pattern", pattern, "--account", account],
    );
    created["id"].as_str().expect("mapping id").to_string()
}

#[test]
fn e2e_status_auto_initializes_a_file_backed_vault() {
    let dir = TempDir::new().expect("temp dir");
    let status = run_ok_json(&dir, &["status"]);
    assert_eq!(status["vault"]["enabled"], true);
    assert_eq!(status["vault"]["providerType"], "file");
    assert_eq!(status["accounts"], 0);
    assert_eq!(status["mappings"], 0);
    assert!(dir.path().join("vault").join("kek.key").exists());
}

#[test]
fn e2e_init_with_env_provider_then_init_again_keeps_first_config() {
    let dir = TempDir::new().expect("temp dir");
    let key = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";
    let first = run_ok_json_with_env(
        &dir,
        &["init", "--provider", "env", "--env-var", "AUTOFILL_TEST_KEY"],
        &[("AUTOFILL_TEST_KEY", key)],
    );
    assert_eq!(first["providerType"], "env");

    let again = run_ok_json_with_env(
        &dir,
        &["init", "--provider", "file"],
        &[("AUTOFILL_TEST_KEY", key)],
    );
    assert_eq!(again["providerType"], "env");
    assert_eq!(again["deviceId"], first["deviceId"]);
}

#[test]
fn e2e_accounts_secrets_and_mappings_lifecycle() {
    let dir = TempDir::new().expect("temp dir");
    let work = add_account(&dir, "Work", "alice@contoso.com");
    let personal = add_account(&dir, "Personal", "alice@example.com");

    run_ok_json(
        &dir,
        &[
            "secrets",
            "set",
            "--account",
            &work,
            "--password",
            "pw-work",
            "--method-detail",
            "JBSWY3DPEHPK3PXP",
        ],
    );
    let exists = run_ok_json(&dir, &["secrets", "exists", &work]);
    assert_eq!(exists["exists"], true);
    let missing = run_ok_json(&dir, &["secrets", "exists", &personal]);
    assert_eq!(missing["exists"], false);

    let listed = run_ok_json(&dir, &["accounts", "list"]);
    let rows = listed.as_array().expect("account rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], "Work");
    assert_eq!(rows[0]["hasSecret"], true);
    assert_eq!(rows[1]["hasSecret"], false);
    assert!(!listed.to_string().contains("pw-work"));

    add_mapping(&dir, "*.contoso.com", &work);
    add_mapping(&dir, "login.contoso.com", &personal);

    let matched = run_ok_json(&dir, &["mappings", "match", "login.contoso.com"]);
    let matched = matched.as_array().expect("matches");
    assert_eq!(matched.len(), 2);
    assert_eq!(matched[0]["accountId"], work.as_str());
    assert_eq!(matched[1]["accountName"], "Personal");

    let other = run_ok_json(&dir, &["mappings", "match", "contoso.com"]);
    assert_eq!(other.as_array().map(Vec::len), Some(0));

    run_ok_json(&dir, &["accounts", "rename", &work, "--name", "Office"]);
    let all = run_ok_json(&dir, &["mappings", "list"]);
    assert_eq!(all[0]["accountName"], "Office");

    let summary = run_ok_json(&dir, &["accounts", "delete", &work]);
    assert_eq!(summary["mappingsRemoved"], 1);
    assert_eq!(summary["accountRemoved"], true);
    let exists = run_ok_json(&dir, &["secrets", "exists", &work]);
    assert_eq!(exists["exists"], false);
    let left = run_ok_json(&dir, &["mappings", "list"]);
    assert_eq!(left.as_array().map(Vec::len), Some(1));
    assert_eq!(left[0]["accountId"], personal.as_str());
}

#[test]
fn e2e_mapping_validation_errors() {
    let dir = TempDir::new().expect("temp dir");
    let work = add_account(&dir, "Work", "alice@contoso.com");

    let err = run_err_text(
        &dir,
        &["mappings", "add", "--pattern", "", "--account", &work],
    );
    assert!(err.contains("invalid_pattern"), "unexpected error: {}", err);

    let ghost = uuid::Uuid::new_v4().to_string();
    let err = run_err_text(
        &dir,
        &["mappings", "add", "--pattern", "a.example.com", "--account", &ghost],
    );
    assert!(err.contains("not_found"), "unexpected error: {}", err);

    add_mapping(&dir, "a.example.com", &work);
    let err = run_err_text(
        &dir,
        &["mappings", "add", "--pattern", "A.Example.com", "--account", &work],
    );
    assert!(err.contains("already exists"), "unexpected error: {}", err);
    run_ok_json(
        &dir,
        &[
            "mappings",
            "add",
            "--pattern",
            "a.example.com",
            "--account",
            &work,
            "--allow-duplicate",
        ],
    );

    let err = run_err_text(&dir, &["mappings", "remove", "no-such-id"]);
    assert!(err.contains("not found"), "unexpected error: {}", err);
}

#[test]
fn e2e_secret_without_otp_detail_is_rejected() {
    let dir = TempDir::new().expect("temp dir");
    let work = add_account(&dir, "Work", "alice@contoso.com");
    let err = run_err_text(
        &dir,
        &["secrets", "set", "--account", &work, "--password", "pw"],
    );
    assert!(err.contains("invalid_request"), "unexpected error: {}", err);
}

#[cfg(unix)]
#[test]
fn e2e_resolve_is_gated_by_the_presence_command() {
    let dir = TempDir::new().expect("temp dir");
    let work = add_account(&dir, "Work", "alice@contoso.com");
    run_ok_json(
        &dir,
        &[
            "secrets",
            "set",
            "--account",
            &work,
            "--password",
            "pw-work",
            "--method-detail",
            "SEED",
        ],
    );
    add_mapping(&dir, "*.contoso.com", &work);

    let approved = run_ok_json_with_env(
        &dir,
        &["resolve", "login.contoso.com"],
        &[("AUTOFILL_PRESENCE_COMMAND", "true")],
    );
    assert_eq!(approved["outcome"], "resolved");
    assert_eq!(approved["credentials"]["username"], "alice@contoso.com");
    assert_eq!(approved["credentials"]["password"], "********");

    let revealed = run_ok_json_with_env(
        &dir,
        &["resolve", "login.contoso.com", "--reveal"],
        &[("AUTOFILL_PRESENCE_COMMAND", "true")],
    );
    assert_eq!(revealed["credentials"]["password"], "pw-work");
    assert_eq!(revealed["credentials"]["methodDetail"], "SEED");

    let output = run_autofill_with_env(
        &dir,
        &["resolve", "login.contoso.com"],
        &[("AUTOFILL_PRESENCE_COMMAND", "false")],
    );
    assert!(!output.status.success());
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("presence_denied"), "unexpected error: {}", err);

    let nothing = run_ok_json(&dir, &["resolve", "unrelated.example.org"]);
    assert_eq!(nothing["outcome"], "not_found");

    let audit = run_ok_json(&dir, &["audit", "--limit", "50"]);
    let kinds: Vec<&str> = audit
        .as_array()
        .expect("audit rows")
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"secret.save"));
    assert!(kinds.contains(&"secret.fetch"));
    assert!(!audit.to_string().contains("pw-work"));
}

#[cfg(unix)]
#[test]
fn e2e_ambiguous_resolve_needs_selection_without_prompting() {
    let dir = TempDir::new().expect("temp dir");
    let a = add_account(&dir, "Personal", "me@example.com");
    let b = add_account(&dir, "Work", "me@contoso.com");
    add_mapping(&dir, "*.contoso.com", &a);
    add_mapping(&dir, "login.contoso.com", &b);

    // A presence command that would fail loudly if it ran.
    let out = run_ok_json_with_env(
        &dir,
        &["resolve", "login.contoso.com"],
        &[("AUTOFILL_PRESENCE_COMMAND", "false")],
    );
    assert_eq!(out["outcome"], "needs_selection");
    let candidates = out["candidates"].as_array().expect("candidates");
    assert_eq!(candidates.len(), 2);
    assert_eq!(candidates[0]["accountId"], a.as_str());
    assert_eq!(candidates[1]["displayName"], "Work");
}

#[test]
fn e2e_agent_without_daemon_reports_connection_lost() {
    let dir = TempDir::new().expect("temp dir");
    let sock = dir.path().join("absent.sock");
    let sock = sock.display().to_string();
    let output = run_autofill_with_env(
        &dir,
        &["agent", "--socket", &sock, "mappings", "--refresh"],
        &[],
    );
    assert!(!output.status.success());
    let err = String::from_utf8_lossy(&output.stderr);
    assert!(err.contains("connection_lost"), "unexpected error: {}", err);
    assert!(
        err.contains("Connection to the autofill app was lost. Please fill this login manually."),
        "missing banner: {}",
        err
    );
}
