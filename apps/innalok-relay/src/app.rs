use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use query_bus::LocalQueryBus;

use crate::auth::{AuthData, AuthStore, PosterAuthClient};
use crate::cli::{AuthCommand, Cli, Command, ConnectArgs, DevicesCommand, ReceiptsCommand, Toggle};
use crate::config::Config;
use crate::error::CliError;
use crate::gateway::{http_client, Credentials, TerminalGateway};
use crate::health::HealthMonitor;
use crate::receipts::{ReceiptCache, ReceiptQuery, ReceiptsClient};
use crate::registry::{Device, DeviceRegistry};
use crate::relay::{NotificationRelay, RelayConfig};
use crate::settings::Settings;
use crate::status::{PosStatus, StatusHub};
use crate::store::{FileStore, KeyValueStore};

/// Every long-lived component, built once per process over a single store.
pub struct App {
    config: Config,
    registry: DeviceRegistry,
    gateway: TerminalGateway,
    settings: Settings,
    auth_store: AuthStore,
    auth_client: PosterAuthClient,
    bus: Arc<LocalQueryBus>,
    receipts: Arc<ReceiptCache>,
}

impl App {
    pub fn open(config: Config) -> Result<Self, CliError> {
        let store = FileStore::open(&config.state_dir)?;
        info!(
            target: "innalok::store",
            path = %store.path().display(),
            "opened state file"
        );
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Result<Self, CliError> {
        let client = http_client(config.http_timeout)?;
        let registry = DeviceRegistry::load(store.clone(), StatusHub::new());
        let gateway =
            TerminalGateway::new(registry.clone(), client.clone(), config.api_base_url.clone());
        let bus = Arc::new(LocalQueryBus::new());
        let receipts = Arc::new(ReceiptCache::new(
            Arc::new(ReceiptsClient::new(client.clone(), config.api_base_url.clone())),
            bus.clone(),
        ));
        Ok(Self {
            registry,
            gateway,
            settings: Settings::new(store.clone()),
            auth_store: AuthStore::new(store),
            auth_client: PosterAuthClient::new(client, config.auth_base_url.clone()),
            bus,
            receipts,
            config,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn gateway(&self) -> &TerminalGateway {
        &self.gateway
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn auth_store(&self) -> &AuthStore {
        &self.auth_store
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.gateway.clone(), self.config.health_interval)
    }

    /// A relay for the stored session. Without one the relay refuses to start.
    pub fn relay(&self) -> NotificationRelay {
        let token = self.auth_store.load().map(|auth| auth.access_token);
        NotificationRelay::new(
            RelayConfig::new(self.config.api_base_url.clone(), token),
            self.gateway.clone(),
            self.settings.clone(),
            self.bus.clone(),
        )
        .with_retry_policy(self.config.retry_policy())
    }

    /// Runs the health monitor and the relay until `shutdown` fires. A relay
    /// that fails to connect or gives up reconnecting is logged and the
    /// monitor keeps running.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), CliError> {
        let monitor = Arc::new(self.health_monitor());
        let health_task = tokio::spawn(monitor.run(shutdown.clone()));
        let status_task = tokio::spawn(log_status_changes(
            self.registry.status().clone(),
            shutdown.clone(),
        ));

        // Held so the refresh loop keeps publishing for the life of the relay.
        let _receipts = self
            .auth_store
            .load()
            .map(|auth| {
                self.receipts
                    .clone()
                    .watch(auth, ReceiptQuery::default(), shutdown.clone())
            });

        let relay = Arc::new(self.relay());
        if let Err(err) = relay.run(shutdown.clone()).await {
            error!(
                target: "innalok::relay",
                error = %err,
                "notification relay stopped; terminal monitoring continues"
            );
        }

        shutdown.cancelled().await;
        if let Err(err) = health_task.await {
            warn!(target: "innalok::health", error = %err, "health monitor task failed");
        }
        let _ = status_task.await;
        Ok(())
    }
}

async fn log_status_changes(status: StatusHub, shutdown: CancellationToken) {
    let mut health = status.subscribe_health();
    let mut last = status.snapshot().label();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.snapshot();
                let label = snapshot.label();
                if label != last {
                    info!(
                        target: "innalok::health",
                        status = label,
                        device_id = snapshot.active_device.as_ref().map(|device| device.id.as_str()),
                        "pos status changed"
                    );
                    last = label;
                }
            }
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::from_env()?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    let app = App::open(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(target: "innalok::app", error = %err, "failed to listen for ctrl-c");
                }
                info!(target: "innalok::app", "shutting down");
                signal.cancel();
            });
            app.serve(shutdown).await
        }
        Command::Devices(command) => devices(&app, command),
        Command::Connect(args) => connect(&app, args).await,
        Command::Status => {
            app.health_monitor().check_health().await;
            print_status(&app.registry().status().snapshot());
            Ok(())
        }
        Command::Auth(command) => auth(&app, command).await,
        Command::Receipts(command) => receipts(&app, command).await,
        Command::RefreshSale { receipt_id } => {
            let auth = signed_in(&app)?;
            app.gateway()
                .refresh_sale(&receipt_id, &auth.access_token)
                .await?;
            println!("Refresh requested for receipt {receipt_id}");
            Ok(())
        }
        Command::AutoForward { state } => {
            match state {
                Toggle::On => app.settings().set_auto_forward(true)?,
                Toggle::Off => app.settings().set_auto_forward(false)?,
                Toggle::Show => {}
            }
            let enabled = app.settings().auto_forward();
            println!("auto-forward: {}", if enabled { "on" } else { "off" });
            Ok(())
        }
    }
}

fn signed_in(app: &App) -> Result<AuthData, CliError> {
    app.auth_store().load().ok_or(CliError::NotSignedIn)
}

fn devices(app: &App, command: DevicesCommand) -> Result<(), CliError> {
    let registry = app.registry();
    match command {
        DevicesCommand::List => {
            let active = registry.active_device().map(|device| device.id);
            let devices = registry.list_devices();
            if devices.is_empty() {
                println!("No saved devices");
            }
            for device in devices {
                let marker = if active.as_deref() == Some(device.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                let login = if device.token().is_some() {
                    "logged in"
                } else {
                    "no token"
                };
                println!(
                    "{marker} {:<22} {:<24} {:<8} {login}",
                    device.id, device.name, device.kind
                );
            }
        }
        DevicesCommand::Add(args) => {
            let device = Device::new(args.name.as_deref(), &args.ip, args.port, args.kind);
            match registry.add_device(device)? {
                Some(device) => println!("Saved {} ({})", device.id, device.name),
                None => println!("Device already saved"),
            }
        }
        DevicesCommand::Remove { id } => match registry.remove_device(&id)? {
            Some(device) => println!("Removed {}", device.id),
            None => println!("No saved device {id}"),
        },
        DevicesCommand::Activate { id } => {
            registry.set_active_device(Some(&id))?;
            println!("Active device: {id}");
        }
        DevicesCommand::Deactivate => {
            registry.set_active_device(None)?;
            println!("No active device");
        }
    }
    Ok(())
}

async fn connect(app: &App, args: ConnectArgs) -> Result<(), CliError> {
    let defaults = &app.config.terminal_credentials;
    let credentials = Credentials {
        name: args.user.unwrap_or_else(|| defaults.name.clone()),
        password: args.password.unwrap_or_else(|| defaults.password.clone()),
    };
    let device = app.gateway().connect_device(&args.id, &credentials).await?;
    println!("Connected to {} ({})", device.id, device.name);
    app.health_monitor().check_health().await;
    print_status(&app.registry().status().snapshot());
    Ok(())
}

async fn auth(app: &App, command: AuthCommand) -> Result<(), CliError> {
    match command {
        AuthCommand::Verify { code, account } => {
            let auth = app
                .auth_client
                .sign_in(app.auth_store(), &code, &account)
                .await?;
            println!(
                "Signed in as account {} ({})",
                auth.account_number, auth.owner_info.company_name
            );
        }
        AuthCommand::Show => match app.auth_store().load() {
            Some(auth) => {
                println!("account: {}", auth.account_number);
                println!("owner:   {}", auth.owner_info.name);
                println!("company: {}", auth.owner_info.company_name);
            }
            None => println!("Not signed in"),
        },
        AuthCommand::Logout => {
            app.auth_store().clear()?;
            println!("Signed out");
        }
    }
    Ok(())
}

async fn receipts(app: &App, command: ReceiptsCommand) -> Result<(), CliError> {
    match command {
        ReceiptsCommand::List {
            page,
            page_size,
            status,
        } => {
            let auth = signed_in(app)?;
            let query = ReceiptQuery {
                page: page.max(1),
                page_size: page_size.max(1),
                tax_status: status.as_query(),
            };
            let result = app.receipts.page(&auth, &query).await?;
            for receipt in &result.receipts {
                let reported = match receipt.tax_status {
                    Some(true) => "reported",
                    Some(false) => "pending",
                    None => "-",
                };
                println!(
                    "{:>8}  {:<20}  {:>10}  {:<9} {}",
                    receipt.id,
                    receipt.date_close.as_deref().unwrap_or("-"),
                    receipt.sum.as_deref().unwrap_or("-"),
                    reported,
                    receipt.fiscal_id.as_deref().unwrap_or(""),
                );
            }
            println!(
                "page {} of {} ({} receipts)",
                result.page,
                result.total_pages(),
                result.total_count
            );
        }
        ReceiptsCommand::Products { receipt_id } => {
            for product in app.receipts.products(receipt_id).await? {
                println!(
                    "{:<32} {:>6} {:>10}",
                    product.product_name.as_deref().unwrap_or("-"),
                    product.num.as_deref().unwrap_or("-"),
                    product.product_sum.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

fn print_status(status: &PosStatus) {
    match &status.active_device {
        Some(device) => println!("device:     {} ({})", device.id, device.name),
        None => println!("device:     none"),
    }
    println!("status:     {}", status.label());
    let last_check = status
        .last_check
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| "never".to_string());
    println!("last check: {last_check}");
}
