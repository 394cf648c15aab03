use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, ValueEnum)]
pub enum ProviderKind {
    Keychain,
    Env,
    File,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AuthMethodArg {
    Otp,
}

impl From<AuthMethodArg> for crate::accounts::AuthMethod {
    fn from(arg: AuthMethodArg) -> Self {
        match arg {
            AuthMethodArg::Otp => Self::Otp,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "autofill")]
#[command(about = "Domain-to-account mapping and presence-gated credential vault for auto-fill")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Status,
    Init {
        #[arg(long, value_enum, default_value_t = ProviderKind::File)]
        provider: ProviderKind,
        #[arg(long)]
        env_var: Option<String>,
        #[arg(long)]
        file_path: Option<String>,
        #[arg(long)]
        keychain_service: Option<String>,
        #[arg(long)]
        keychain_account: Option<String>,
    },
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
    Mappings {
        #[command(subcommand)]
        command: MappingsCommand,
    },
    /// Resolve an origin in-process, as the privileged side would.
    Resolve {
        origin: String,
        /// Print the password and method detail instead of masking them.
        #[arg(long)]
        reveal: bool,
    },
    Audit {
        #[arg(long, default_value_t = 200)]
        limit: usize,
        #[arg(long)]
        before_ts_ms: Option<i64>,
    },
    /// Talk to a running `autofilld` the way the filling agent does.
    Agent {
        /// Bridge socket path (defaults to AUTOFILLD_SOCKET or the run dir).
        #[arg(long)]
        socket: Option<String>,
        #[command(subcommand)]
        command: AgentCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum AccountsCommand {
    List,
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        username: String,
        #[arg(long, value_enum, default_value_t = AuthMethodArg::Otp)]
        auth_method: AuthMethodArg,
    },
    Rename {
        id: String,
        #[arg(long)]
        name: String,
    },
    /// Delete the account with its mappings and stored secret.
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
pub enum SecretsCommand {
    Set {
        #[arg(long)]
        account: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        method_detail: Option<String>,
    },
    Exists { account: String },
    Delete { account: String },
}

#[derive(Debug, Subcommand)]
pub enum MappingsCommand {
    List,
    Add {
        #[arg(long)]
        pattern: String,
        #[arg(long)]
        account: String,
        /// Allow a pattern another mapping already uses.
        #[arg(long)]
        allow_duplicate: bool,
    },
    Remove { id: String },
    /// Show which mappings match an origin, in match order.
    Match { origin: String },
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    Mappings {
        #[arg(long)]
        refresh: bool,
    },
    /// Local candidate lookup against the cached mapping list.
    Candidates { origin: String },
    Resolve { origin: String },
    Select {
        #[arg(long)]
        selection: String,
        #[arg(long)]
        account: String,
    },
    Credentials {
        account: String,
        #[arg(long)]
        reveal: bool,
    },
}
