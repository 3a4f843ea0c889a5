use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "authzd", about = "Multi-tenant authorization decision service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the decision service.
    Serve {
        /// Listen port; overrides AUTHZD_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Organization bootstrap.
    Org {
        #[command(subcommand)]
        command: OrgCommands,
    },
    /// User bootstrap.
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// API key management.
    ApiKey {
        #[command(subcommand)]
        command: ApiKeyCommands,
    },
}

#[derive(Subcommand)]
pub enum OrgCommands {
    /// Create an organization.
    Create {
        /// Globally-unique organization name.
        name: String,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user inside an organization.
    Create {
        /// Organization id (uuid).
        #[arg(long)]
        org_id: String,
        /// Email, unique within the organization.
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
pub enum ApiKeyCommands {
    /// Issue a new API key. The raw key is printed once and never stored.
    Issue {
        /// Organization id (uuid).
        #[arg(long)]
        org_id: String,
        /// Human-readable key name.
        #[arg(long)]
        name: String,
    },
}
