#![cfg(feature = "cli")]
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use uuid::Uuid;

use rscdm::cdm::Cdm;
use rscdm::config::CdmConfig;
use rscdm::key::KeyStatusEntry;
use rscdm::pssh::Pssh;
use rscdm::types::{MessageType, SessionState, SessionType, SuccessValue};
use rscdm::{ClientContext, InstanceHandle, SessionClient};

#[cfg(feature = "chrono")]
use chrono::Datelike;

#[derive(Parser)]
#[command(name = "rscdm", version, disable_version_flag = true, about = "rscdm CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Print what a key system supports.
    Capabilities { key_system: String },
    /// Check a configuration file against its key system and initialize it.
    Check { config_path: PathBuf },
    /// Run a license exchange for some init data.
    ///
    /// Prints the license request. With `--response`, hands the file's
    /// contents to the session as the license server's answer.
    License {
        config_path: PathBuf,
        #[arg(short = 't', long = "init-data-type", default_value = "cenc")]
        init_data_type: String,
        /// Init data, base64.
        #[arg(short = 'i', long = "init-data")]
        init_data: String,
        #[arg(short = 'r', long = "response")]
        response: Option<PathBuf>,
        #[arg(short = 's', long = "session-type", default_value = "temporary")]
        session_type: String,
    },
    /// Build a common-format PSSH box for key ids given as UUIDs or hex.
    Pssh { key_ids: Vec<String> },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(level).init();

    let version = env!("CARGO_PKG_VERSION");
    info!("rscdm version {} ({})", version, current_year());

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Capabilities { key_system }) => run_capabilities(&key_system),
        Some(Commands::Check { config_path }) => run_check(&config_path),
        Some(Commands::License {
            config_path,
            init_data_type,
            init_data,
            response,
            session_type,
        }) => run_license(
            &config_path,
            &init_data_type,
            &init_data,
            response.as_deref(),
            &session_type,
        ),
        Some(Commands::Pssh { key_ids }) => run_pssh(&key_ids),
        None => Ok(()),
    }
}

fn current_year() -> i64 {
    #[cfg(feature = "chrono")]
    {
        chrono::Local::now().year().into()
    }
    #[cfg(not(feature = "chrono"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() / 31_536_000 + 1970)
            .unwrap_or(2024) as i64
    }
}

fn run_capabilities(key_system: &str) -> anyhow::Result<()> {
    let cdm = Cdm::create(key_system).context("Failed to attach key system")?;
    cdm.load_and_initialize();

    info!("[+] {}", cdm.key_system());
    info!(" + Init data types: {}", cdm.supported_init_data_types().join(", "));
    let robustnesses: Vec<String> = cdm
        .supported_robustnesses()
        .into_iter()
        .map(|r| if r.is_empty() { "\"\"".to_string() } else { r })
        .collect();
    info!(" + Robustness levels: {}", robustnesses.join(", "));
    info!(" + Server certificates: {}", cdm.supports_server_certificates());
    info!(" + Sessions: {}", cdm.supports_sessions());
    Ok(())
}

/// Wait on `ctx` until `slot` is filled.
fn wait_for<T>(
    ctx: &mut ClientContext,
    slot: &Rc<RefCell<Option<T>>>,
    timeout: Duration,
    what: &str,
) -> anyhow::Result<T> {
    let watched = slot.clone();
    if !ctx.run_until(timeout, move |_| watched.borrow().is_some()) {
        anyhow::bail!("Timed out waiting for {}", what);
    }
    slot.borrow_mut()
        .take()
        .with_context(|| format!("No result for {}", what))
}

fn setup_instance(
    config: &CdmConfig,
    ctx: &mut ClientContext,
) -> anyhow::Result<(Cdm, InstanceHandle)> {
    let cdm = Cdm::create(&config.key_system).context("Failed to attach key system")?;
    let instance = cdm.create_instance(ctx);
    if let Some(dir) = &config.storage_directory {
        ctx.set_storage_directory(instance, dir)?;
    }
    ctx.set_music_player_enabled(instance, config.music_player)?;

    let initialized = Rc::new(RefCell::new(None));
    let sink = initialized.clone();
    ctx.initialize_with_configuration(
        instance,
        &config.configuration,
        config.distinctive_identifiers(),
        config.persistent_state(),
        move |_, success| *sink.borrow_mut() = Some(success),
    )?;
    let success = wait_for(ctx, &initialized, config.completion_timeout(), "initialization")?;
    if success != SuccessValue::Succeeded {
        anyhow::bail!(
            "{} rejected configuration {:?}",
            config.key_system,
            config.configuration.label
        );
    }
    info!("[+] Initialized {} ({:?})", config.key_system, config.configuration.label);

    if let Some(certificate) = config
        .read_server_certificate()
        .context("Failed to read server certificate")?
    {
        let installed = Rc::new(RefCell::new(None));
        let sink = installed.clone();
        ctx.set_server_certificate(instance, certificate, move |_, success| {
            *sink.borrow_mut() = Some(success)
        })?;
        match wait_for(ctx, &installed, config.completion_timeout(), "server certificate")? {
            SuccessValue::Succeeded => info!(" + Installed server certificate"),
            SuccessValue::Failed => warn!(" - Server certificate was not accepted"),
        }
    }
    Ok((cdm, instance))
}

fn run_check(config_path: &Path) -> anyhow::Result<()> {
    let config = CdmConfig::from_path(config_path).context("Failed to load config")?;
    let cdm = Cdm::create(&config.key_system).context("Failed to attach key system")?;
    let requested = &config.configuration;

    info!("[+] Checking {:?} against {}", requested.label, cdm.key_system());
    info!(" + Supported: {}", cdm.supports_configuration(requested));
    info!(
        " + Supported with restrictions: {}",
        cdm.supports_configuration_with_restrictions(requested, &config.restrictions)
    );
    for session_type in requested.requested_session_types() {
        info!(
            " + {} sessions: {}",
            session_type.as_str(),
            cdm.supports_session_type_with_configuration(session_type, requested)
        );
    }
    info!(
        " + Distinctive identifiers: {:?}",
        cdm.distinctive_identifiers_requirement(requested, &config.restrictions)
    );
    info!(
        " + Persistent state: {:?}",
        cdm.persistent_state_requirement(requested, &config.restrictions)
    );

    let mut ctx = ClientContext::new()?;
    setup_instance(&config, &mut ctx)?;
    Ok(())
}

/// Logs every notification a session pushes.
struct LoggingClient;

impl SessionClient for LoggingClient {
    fn update_key_statuses(&mut self, statuses: &[KeyStatusEntry]) {
        for entry in statuses {
            info!(" + Key {}: {}", entry.display_key_id(), entry.status.as_str());
        }
    }

    fn send_message(&mut self, message_type: MessageType, message: &[u8]) {
        info!(" + {:?} message ({} bytes)", message_type, message.len());
    }

    fn session_id_changed(&mut self, session_id: &str) {
        info!("[+] Session id: {}", session_id);
    }
}

fn parse_session_type(value: &str) -> anyhow::Result<SessionType> {
    match value {
        "temporary" => Ok(SessionType::Temporary),
        "persistent-license" => Ok(SessionType::PersistentLicense),
        "persistent-usage-record" => Ok(SessionType::PersistentUsageRecord),
        _ => anyhow::bail!("Invalid session type '{}'", value),
    }
}

fn print_payload(label: &str, payload: &[u8]) {
    match std::str::from_utf8(payload) {
        Ok(text) => info!("{}:\n{}", label, text),
        Err(_) => info!(
            "{}: {}",
            label,
            base64::engine::general_purpose::STANDARD.encode(payload)
        ),
    }
}

fn run_license(
    config_path: &Path,
    init_data_type: &str,
    init_data_b64: &str,
    response_path: Option<&Path>,
    session_type: &str,
) -> anyhow::Result<()> {
    let config = CdmConfig::from_path(config_path).context("Failed to load config")?;
    let session_type = parse_session_type(session_type)?;
    let init_data = base64::engine::general_purpose::STANDARD
        .decode(init_data_b64)
        .context("Init data is not valid base64")?;
    let timeout = config.completion_timeout();

    let mut ctx = ClientContext::new()?;
    let (cdm, instance) = setup_instance(&config, &mut ctx)?;
    if !cdm.supports_init_data(init_data_type, &init_data) {
        anyhow::bail!("{} cannot use this {} init data", cdm.key_system(), init_data_type);
    }

    let session = ctx.create_session(instance)?;
    ctx.set_session_client(session, LoggingClient)?;

    let license = Rc::new(RefCell::new(None));
    let sink = license.clone();
    ctx.request_license(
        session,
        session_type,
        init_data_type,
        init_data,
        move |_, outcome| *sink.borrow_mut() = Some(outcome),
    )?;
    let request = wait_for(&mut ctx, &license, timeout, "license request")?;
    if request.success != SuccessValue::Succeeded {
        anyhow::bail!("License request failed");
    }
    print_payload("[+] License request", &request.message);

    let session_id = ctx
        .session_id(session)?
        .map(str::to_string)
        .unwrap_or(request.session_id);

    if let Some(path) = response_path {
        let response = std::fs::read(path).context("Failed to read license response")?;
        let response = cdm.sanitize_response(&response);
        if response.is_empty() {
            anyhow::bail!("License response was rejected by {}", cdm.key_system());
        }

        let update = Rc::new(RefCell::new(None));
        let sink = update.clone();
        ctx.update_license(session, &session_id, session_type, response, move |_, outcome| {
            *sink.borrow_mut() = Some(outcome)
        })?;
        let outcome = wait_for(&mut ctx, &update, timeout, "license update")?;
        if outcome.success != SuccessValue::Succeeded {
            error!("[-] License update failed");
        }
        for entry in outcome.key_statuses.unwrap_or_default() {
            info!(" + {} {}", entry.display_key_id(), entry.status.as_str());
        }
        if let Some(message) = outcome.message {
            print_payload(&format!("[+] {:?}", message.message_type), &message.payload);
        }
    }

    if ctx.session_state(session)? != SessionState::Closed {
        let closed = Rc::new(RefCell::new(None));
        let sink = closed.clone();
        ctx.close_session(session, &session_id, move |_| *sink.borrow_mut() = Some(()))?;
        wait_for(&mut ctx, &closed, timeout, "session close")?;
    }
    info!("[+] Closed session {}", session_id);
    ctx.destroy_instance(instance)?;
    Ok(())
}

fn parse_key_id(value: &str) -> anyhow::Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(value) {
        return Ok(uuid);
    }
    let bytes = hex::decode(value).with_context(|| format!("Invalid key id '{}'", value))?;
    Uuid::from_slice(&bytes).with_context(|| format!("Key id '{}' is not 16 bytes", value))
}

fn run_pssh(key_ids: &[String]) -> anyhow::Result<()> {
    if key_ids.is_empty() {
        anyhow::bail!("At least one key id is required");
    }
    let key_ids = key_ids
        .iter()
        .map(|kid| parse_key_id(kid))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let pssh = Pssh::common(key_ids);
    println!("{}", pssh.to_base64());
    Ok(())
}
