use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::accounts::AccountId;
use crate::cli::{
    AccountsCommand, AgentCommand, Cli, Command, MappingsCommand, ProviderKind, SecretsCommand,
};
use crate::config::BridgeConfig;
use crate::presence::PresenceGate;
use crate::service::{Credentials, ResolutionOutcome, Service};
use crate::vault::{
    read_audit_events, read_audit_events_before, CredentialVault, VaultProviderConfig,
    DEFAULT_KEYCHAIN_ACCOUNT, DEFAULT_KEYCHAIN_SERVICE, DEFAULT_KEY_ENV_VAR,
};

const MASK: &str = "********";

pub fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Init {
            provider,
            env_var,
            file_path,
            keychain_service,
            keychain_account,
        } => run_init(
            provider,
            env_var,
            file_path,
            keychain_service,
            keychain_account,
        ),
        Command::Agent { socket, command } => run_agent(socket.as_deref(), command),
        command => {
            let config = BridgeConfig::from_env();
            let service = Service::discover(config.selection_ttl)?;
            run_local(&service, command)
        }
    }
}

fn run_local(service: &Service, command: Command) -> Result<(), String> {
    match command {
        Command::Status => run_status(service),
        Command::Accounts { command } => run_accounts(service, command),
        Command::Secrets { command } => run_secrets(service, command),
        Command::Mappings { command } => run_mappings(service, command),
        Command::Resolve { origin, reveal } => {
            let outcome = service.resolve(&origin).map_err(|e| e.to_string())?;
            print_json(&outcome_json(outcome, reveal))
        }
        Command::Audit {
            limit,
            before_ts_ms,
        } => {
            let audit_dir = service.vault().paths().audit_dir();
            let events = match before_ts_ms.filter(|v| *v > 0) {
                Some(before) => read_audit_events_before(&audit_dir, limit, Some(before))?,
                None => read_audit_events(&audit_dir, limit)?,
            };
            print_json(&events)
        }
        Command::Init { .. } | Command::Agent { .. } => {
            Err("command is not handled by the local service".to_string())
        }
    }
}

fn run_status(service: &Service) -> Result<(), String> {
    let paths = service.vault().paths();
    let payload = json!({
        "vault": service.vault_status(),
        "accounts": service.list_accounts().map_err(|e| e.to_string())?.len(),
        "mappings": service.get_all_mappings().map_err(|e| e.to_string())?.len(),
        "paths": {
            "rootDir": service.root().display().to_string(),
            "vaultDir": paths.root_dir().display().to_string(),
            "auditDir": paths.audit_dir().display().to_string(),
            "socket": crate::config::resolve_socket_path(None).display().to_string(),
        }
    });
    print_json(&payload)
}

fn run_init(
    provider: ProviderKind,
    env_var: Option<String>,
    file_path: Option<String>,
    keychain_service: Option<String>,
    keychain_account: Option<String>,
) -> Result<(), String> {
    let gate = Arc::new(PresenceGate::from_env());
    let vault = CredentialVault::discover(gate);
    let provider = match provider {
        ProviderKind::Keychain => VaultProviderConfig::Keychain {
            service: keychain_service.unwrap_or_else(|| DEFAULT_KEYCHAIN_SERVICE.to_string()),
            account: keychain_account.unwrap_or_else(|| DEFAULT_KEYCHAIN_ACCOUNT.to_string()),
        },
        ProviderKind::Env => VaultProviderConfig::Env {
            env_var: env_var.unwrap_or_else(|| DEFAULT_KEY_ENV_VAR.to_string()),
        },
        ProviderKind::File => VaultProviderConfig::File {
            path: file_path
                .unwrap_or_else(|| vault.paths().default_key_path().display().to_string()),
        },
    };
    let status = vault.init(provider).map_err(|e| e.to_string())?;
    print_json(&status)
}

fn parse_account(raw: &str) -> Result<AccountId, String> {
    AccountId::parse(raw)
}

fn run_accounts(service: &Service, command: AccountsCommand) -> Result<(), String> {
    match command {
        AccountsCommand::List => {
            let accounts = service.list_accounts().map_err(|e| e.to_string())?;
            let rows: Vec<Value> = accounts
                .into_iter()
                .map(|a| {
                    let has_secret = service.secret_exists(&a.id);
                    json!({
                        "id": a.id,
                        "name": a.name,
                        "username": a.username,
                        "authMethod": a.auth_method,
                        "hasSecret": has_secret,
                    })
                })
                .collect();
            print_json(&rows)
        }
        AccountsCommand::Add {
            name,
            username,
            auth_method,
        } => {
            let account = service
                .add_account(&name, &username, auth_method.into())
                .map_err(|e| e.to_string())?;
            print_json(&account)
        }
        AccountsCommand::Rename { id, name } => {
            let account = service
                .rename_account(&parse_account(&id)?, &name)
                .map_err(|e| e.to_string())?;
            print_json(&account)
        }
        AccountsCommand::Delete { id } => {
            let summary = service
                .delete_account(&parse_account(&id)?)
                .map_err(|e| e.to_string())?;
            print_json(&summary)
        }
    }
}

fn run_secrets(service: &Service, command: SecretsCommand) -> Result<(), String> {
    match command {
        SecretsCommand::Set {
            account,
            password,
            method_detail,
        } => {
            let id = parse_account(&account)?;
            service
                .save_secret(&id, &password, method_detail)
                .map_err(|e| e.to_string())?;
            print_json(&json!({ "accountId": id, "saved": true }))
        }
        SecretsCommand::Exists { account } => {
            let id = parse_account(&account)?;
            let exists = service.secret_exists(&id);
            print_json(&json!({ "accountId": id, "exists": exists }))
        }
        SecretsCommand::Delete { account } => {
            let id = parse_account(&account)?;
            service.delete_secret(&id).map_err(|e| e.to_string())?;
            print_json(&json!({ "accountId": id, "deleted": true }))
        }
    }
}

fn run_mappings(service: &Service, command: MappingsCommand) -> Result<(), String> {
    match command {
        MappingsCommand::List => {
            print_json(&service.get_all_mappings().map_err(|e| e.to_string())?)
        }
        MappingsCommand::Add {
            pattern,
            account,
            allow_duplicate,
        } => {
            let mapping = service
                .add_mapping(&pattern, &parse_account(&account)?, allow_duplicate)
                .map_err(|e| e.to_string())?;
            print_json(&mapping)
        }
        MappingsCommand::Remove { id } => {
            let removed = service.remove_mapping(&id).map_err(|e| e.to_string())?;
            if !removed {
                return Err(format!("mapping '{}' not found", id));
            }
            print_json(&json!({ "id": id, "removed": true }))
        }
        MappingsCommand::Match { origin } => {
            print_json(&service.match_origin(&origin).map_err(|e| e.to_string())?)
        }
    }
}

fn credentials_json(credentials: &Credentials, reveal: bool) -> Value {
    let masked = |v: &str| {
        if reveal {
            v.to_string()
        } else {
            MASK.to_string()
        }
    };
    json!({
        "username": credentials.username,
        "password": masked(&credentials.password),
        "authMethod": credentials.auth_method,
        "methodDetail": credentials.method_detail.as_deref().map(masked),
    })
}

fn outcome_json(outcome: ResolutionOutcome, reveal: bool) -> Value {
    match outcome {
        ResolutionOutcome::NotFound => json!({ "outcome": "not_found" }),
        ResolutionOutcome::Resolved {
            account_id,
            credentials,
        } => json!({
            "outcome": "resolved",
            "accountId": account_id,
            "credentials": credentials_json(&credentials, reveal),
        }),
        ResolutionOutcome::AmbiguousNeedsSelection {
            selection_id,
            candidates,
        } => json!({
            "outcome": "needs_selection",
            "selectionId": selection_id,
            "candidates": candidates,
        }),
    }
}

#[cfg(unix)]
fn run_agent(socket: Option<&str>, command: AgentCommand) -> Result<(), String> {
    use crate::bridge::cache::{AgentSession, MappingCache};
    use crate::bridge::client::BridgeClient;
    use crate::error::FillError;

    let config = BridgeConfig::from_env();
    let socket_path = crate::config::resolve_socket_path(socket);
    let session = AgentSession::new(
        BridgeClient::new(socket_path, config),
        MappingCache::discover(),
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;

    // Remote failures print the user-facing banner, then `code: message` like local ones.
    let fail = |err: crate::bridge::client::BridgeClientError| agent_failure(FillError::from(err));

    runtime.block_on(async {
        match command {
            AgentCommand::Mappings { refresh } => {
                print_json(&session.mappings(refresh).await.map_err(fail)?)
            }
            AgentCommand::Candidates { origin } => {
                print_json(&session.candidates_for(&origin).await.map_err(fail)?)
            }
            AgentCommand::Resolve { origin } => print_json(
                &session
                    .client()
                    .resolve_origin(&origin)
                    .await
                    .map_err(fail)?,
            ),
            AgentCommand::Select { selection, account } => {
                let account_id = parse_account(&account)?;
                print_json(
                    &session
                        .client()
                        .select_account(&selection, &account_id)
                        .await
                        .map_err(fail)?,
                )
            }
            AgentCommand::Credentials { account, reveal } => {
                let account_id = parse_account(&account)?;
                let credentials = session.credentials(&account_id).await.map_err(fail)?;
                print_json(&credentials_json(&credentials, reveal))
            }
        }
    })
}

#[cfg(unix)]
fn agent_failure(err: crate::error::FillError) -> String {
    format!("{}\n{}", err.error.user_message(), err)
}

#[cfg(not(unix))]
fn run_agent(_socket: Option<&str>, _command: AgentCommand) -> Result<(), String> {
    Err("the autofill bridge requires a unix-like OS (no unix sockets available)".to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let raw = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", raw);
    Ok(())
}
