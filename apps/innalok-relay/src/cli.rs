use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::receipts::DEFAULT_PAGE_SIZE;
use crate::registry::{DeviceKind, DEFAULT_TERMINAL_PORT};
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "innalok-relay",
    about = "Relay Poster sale events to an Omnisoft fiscal terminal",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "INNALOK_STATE_DIR",
        value_name = "DIR",
        help = "Directory holding saved devices, auth and settings"
    )]
    pub state_dir: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "INNALOK_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "INNALOK_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the notification relay and terminal health monitor until Ctrl-C (default)
    Run,
    /// Manage saved devices
    #[command(subcommand)]
    Devices(DevicesCommand),
    /// Log in to a saved terminal and make it the active device
    Connect(ConnectArgs),
    /// Check the active terminal once and print its status
    Status,
    /// Manage the Poster owner session
    #[command(subcommand)]
    Auth(AuthCommand),
    /// Browse receipts known to the tax backend
    #[command(subcommand)]
    Receipts(ReceiptsCommand),
    /// Ask the tax backend to resend a sale for fiscalization
    RefreshSale {
        #[arg(value_name = "RECEIPT_ID")]
        receipt_id: String,
    },
    /// Show or change whether hub notifications are forwarded to the terminal
    AutoForward {
        #[arg(value_enum, default_value_t = Toggle::Show)]
        state: Toggle,
    },
}

#[derive(Subcommand, Debug)]
pub enum DevicesCommand {
    /// List saved devices, marking the active one
    List,
    /// Save a device by address
    Add(AddDeviceArgs),
    /// Forget a saved device
    Remove {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Make a saved device the active one
    Activate {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// Clear the active device
    Deactivate,
}

#[derive(Args, Debug)]
pub struct AddDeviceArgs {
    #[arg(long, value_name = "IP", help = "Terminal address on the local network")]
    pub ip: String,

    #[arg(long, default_value_t = DEFAULT_TERMINAL_PORT, help = "Terminal RPC port")]
    pub port: u16,

    #[arg(long, help = "Display name (defaults to \"Device <ip>\")")]
    pub name: Option<String>,

    #[arg(long, value_enum, default_value_t = DeviceKind::Terminal)]
    pub kind: DeviceKind,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[arg(value_name = "ID", help = "Saved device id (ip:port)")]
    pub id: String,

    #[arg(
        long,
        env = "INNALOK_TERMINAL_USER",
        help = "Terminal login name (defaults to the configured account)"
    )]
    pub user: Option<String>,

    #[arg(
        long,
        env = "INNALOK_TERMINAL_PASSWORD",
        hide_env_values = true,
        help = "Terminal login password"
    )]
    pub password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Exchange a Poster OAuth code for a backend session and store it
    Verify {
        #[arg(long)]
        code: String,
        #[arg(long)]
        account: String,
    },
    /// Print the stored session
    Show,
    /// Forget the stored session
    Logout,
}

#[derive(Subcommand, Debug)]
pub enum ReceiptsCommand {
    /// List one page of receipts
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long = "page-size", default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
        #[arg(long, value_enum, default_value_t = TaxStatusFilter::All)]
        status: TaxStatusFilter,
    },
    /// List the products on one receipt
    Products {
        #[arg(value_name = "RECEIPT_ID")]
        receipt_id: i64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TaxStatusFilter {
    All,
    Reported,
    Pending,
}

impl TaxStatusFilter {
    pub fn as_query(self) -> Option<bool> {
        match self {
            TaxStatusFilter::All => None,
            TaxStatusFilter::Reported => Some(true),
            TaxStatusFilter::Pending => Some(false),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Toggle {
    On,
    Off,
    Show,
}
