mod cli;
mod config;
mod storage;

use std::{fs, path::Path};

use crate::cli::{Command, ConfigCommand, DbCommand, MailCommand, RecordKind};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use sealbox_core::{
    settings::{DbConnectionParams, EmailSettings},
    storage::BlobStore,
};
use sealbox_storage::{
    cipher::{self, ALG_AES128_GCM, BLOCK_LEN, HEADER_LEN, IV_LEN, NONCE_LEN, TAG_LEN},
    EnvelopeFormat, ObjectStore, StoreError,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_PROBE: &str = "health.probe";

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let format = cli.format;
    match cli.command {
        Command::Db(cmd) => run_db(cmd, &config, format)?,
        Command::Mail(cmd) => run_mail(cmd, &config, format)?,
        Command::Demo => run_demo(&config, format)?,
        Command::Inspect { file } => run_inspect(&file, &config)?,
        Command::Reseal { file, kind } => run_reseal(&file, kind, &config, format)?,
        Command::Health => run_health_check(&config, format)?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Version => print_version(),
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info. Logs go to stderr so stdout stays scriptable.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("sealbox {}", env!("CARGO_PKG_VERSION"));
}

fn run_db(cmd: DbCommand, config: &config::Config, format: Option<EnvelopeFormat>) -> Result<()> {
    let store: ObjectStore<DbConnectionParams> = storage::store_from_config(config, format)?;
    match cmd {
        DbCommand::Set {
            server,
            database,
            user,
            password,
            target,
        } => {
            let location = storage::location(target.file.as_deref(), storage::DB_SETTINGS_FILE)?;
            let params = DbConnectionParams {
                server_name: server,
                database_name: database,
                user_name: user,
                password,
            };
            store.save(&location, &params).map_err(report)?;
            println!("Database settings saved to {location}");
        }
        DbCommand::Show { target, reveal } => {
            let location = storage::location(target.file.as_deref(), storage::DB_SETTINGS_FILE)?;
            let params = load_settings(&store, &location, "db")?;
            println!("{}", describe_db(&params, reveal));
        }
    }
    Ok(())
}

fn run_mail(
    cmd: MailCommand,
    config: &config::Config,
    format: Option<EnvelopeFormat>,
) -> Result<()> {
    let store: ObjectStore<EmailSettings> = storage::store_from_config(config, format)?;
    match cmd {
        MailCommand::Set {
            server,
            port,
            address,
            password,
            no_ssl,
            plain_text,
            target,
        } => {
            let location =
                storage::location(target.file.as_deref(), storage::MAIL_SETTINGS_FILE)?;
            let settings = EmailSettings {
                smtp_server_name: server,
                smtp_port_number: port,
                email_address: address,
                password,
                use_ssl: !no_ssl,
                body_is_html: !plain_text,
            };
            store.save(&location, &settings).map_err(report)?;
            println!("Mail settings saved to {location}");
        }
        MailCommand::Show { target, reveal } => {
            let location =
                storage::location(target.file.as_deref(), storage::MAIL_SETTINGS_FILE)?;
            let settings = load_settings(&store, &location, "mail")?;
            println!("{}", describe_mail(&settings, reveal));
        }
    }
    Ok(())
}

/// Saves the sample records the tool has always shipped with, then loads them
/// back the way the database and mail layers do.
fn run_demo(config: &config::Config, format: Option<EnvelopeFormat>) -> Result<()> {
    let db_store: ObjectStore<DbConnectionParams> = storage::store_from_config(config, format)?;
    let mail_store: ObjectStore<EmailSettings> = storage::store_from_config(config, format)?;

    let params = DbConnectionParams {
        server_name: "MONO".into(),
        database_name: "DatabaseScript".into(),
        user_name: "sa".into(),
        password: "nada123".into(),
    };
    let settings = EmailSettings {
        smtp_server_name: "smtp.example.com".into(),
        smtp_port_number: 587,
        email_address: "ops@example.com".into(),
        password: "my-password".into(),
        use_ssl: true,
        body_is_html: true,
    };

    db_store
        .save(storage::DB_SETTINGS_FILE, &params)
        .map_err(report)?;
    mail_store
        .save(storage::MAIL_SETTINGS_FILE, &settings)
        .map_err(report)?;
    info!(format = %db_store.cipher().format(), "sample settings saved");

    let loaded_db = db_store.load(storage::DB_SETTINGS_FILE).map_err(report)?;
    let loaded_mail = mail_store
        .load(storage::MAIL_SETTINGS_FILE)
        .map_err(report)?;
    println!("{}", describe_db(&loaded_db, false));
    println!("{}", describe_mail(&loaded_mail, false));

    if loaded_db != params || loaded_mail != settings {
        color_eyre::eyre::bail!("demo round-trip returned different settings");
    }
    Ok(())
}

fn run_inspect(file: &Path, config: &config::Config) -> Result<()> {
    let text = fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;
    let envelope = cipher::from_text(&text)?;
    println!("File:     {}", file.display());
    println!("Envelope: {} bytes", envelope.len());
    println!("{}", describe_envelope(&envelope));

    let cipher = storage::cipher_from_config(config, None)?;
    match cipher.decrypt(&envelope) {
        Ok(plain) => println!("Decrypts: yes ({} bytes of text)", plain.len()),
        Err(err) => println!("Decrypts: no ({err})"),
    }
    Ok(())
}

fn run_reseal(
    file: &Path,
    kind: RecordKind,
    config: &config::Config,
    format: Option<EnvelopeFormat>,
) -> Result<()> {
    let location = storage::location(Some(file), "")?;
    match kind {
        RecordKind::Db => reseal_with::<DbConnectionParams>(&location, config, format)?,
        RecordKind::Mail => reseal_with::<EmailSettings>(&location, config, format)?,
    }
    println!(
        "Rewrote {location} as {}",
        format.unwrap_or_else(|| config.format())
    );
    Ok(())
}

fn reseal_with<T: Serialize + DeserializeOwned>(
    location: &str,
    config: &config::Config,
    format: Option<EnvelopeFormat>,
) -> Result<()> {
    let store: ObjectStore<T> = storage::store_from_config(config, format)?;
    store.reseal(location).map_err(report)
}

/// Runs a quick health check of the encrypted storage path.
fn run_health_check(config: &config::Config, format: Option<EnvelopeFormat>) -> Result<()> {
    let store: ObjectStore<DbConnectionParams> = storage::store_from_config(config, format)?;
    run_store_health(&store)?;
    println!("Storage: ok ({})", store.cipher().format());
    Ok(())
}

fn run_store_health<B: BlobStore>(store: &ObjectStore<DbConnectionParams, B>) -> Result<()> {
    let probe = DbConnectionParams {
        server_name: "probe".into(),
        database_name: "probe".into(),
        user_name: "probe".into(),
        password: "probe".into(),
    };
    store.save(HEALTH_PROBE, &probe).map_err(report)?;
    let round_trip = store.load(HEALTH_PROBE).map_err(report);
    store.blobs().remove(HEALTH_PROBE)?;

    if round_trip? != probe {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn load_settings<T, B>(store: &ObjectStore<T, B>, location: &str, command: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    B: BlobStore,
{
    store.load(location).map_err(|err| {
        if err.is_not_found() {
            eyre!("no settings saved at {location} yet; run `sealbox {command} set` first")
        } else {
            report(err)
        }
    })
}

fn report(err: StoreError) -> color_eyre::Report {
    eyre!("{} error: {err}", stage_name(&err))
}

fn stage_name(err: &StoreError) -> &'static str {
    use sealbox_storage::ErrorKind;
    match err.kind() {
        ErrorKind::Serialization => "serialization",
        ErrorKind::Deserialization => "deserialization",
        ErrorKind::Cipher => "cipher",
        ErrorKind::NotFound | ErrorKind::Storage => "storage",
    }
}

fn describe_db(params: &DbConnectionParams, reveal: bool) -> String {
    let connection = if reveal {
        params.connection_string()
    } else {
        params.redacted_connection_string()
    };
    format!("Database: {connection}")
}

fn describe_mail(settings: &EmailSettings, reveal: bool) -> String {
    let password = if reveal {
        settings.password.as_str()
    } else {
        "********"
    };
    format!(
        "Mail:     {}@{}:{} password={} ssl={} html={}",
        settings.email_address,
        settings.smtp_server_name,
        settings.smtp_port_number,
        password,
        settings.use_ssl,
        settings.body_is_html
    )
}

fn describe_envelope(envelope: &[u8]) -> String {
    match EnvelopeFormat::detect(envelope) {
        EnvelopeFormat::Legacy if envelope.len() >= IV_LEN => {
            let ciphertext = envelope.len() - IV_LEN;
            let aligned = ciphertext > 0 && ciphertext % BLOCK_LEN == 0;
            format!(
                "Format:   legacy (AES-128-CBC, unauthenticated)\nBlocks:   {} ({})",
                ciphertext / BLOCK_LEN,
                if aligned { "aligned" } else { "misaligned" }
            )
        }
        EnvelopeFormat::Legacy => "Format:   legacy (truncated, shorter than one IV)".to_string(),
        EnvelopeFormat::Sealed if envelope.len() >= HEADER_LEN => {
            let alg = if envelope[HEADER_LEN - 1] == ALG_AES128_GCM {
                "AES-128-GCM".to_string()
            } else {
                format!("unknown algorithm {:#04x}", envelope[HEADER_LEN - 1])
            };
            let payload = envelope
                .len()
                .saturating_sub(HEADER_LEN + NONCE_LEN + TAG_LEN);
            format!(
                "Format:   sealed v{} ({alg})\nPayload:  {payload} bytes",
                envelope[HEADER_LEN - 2]
            )
        }
        EnvelopeFormat::Sealed => "Format:   sealed (truncated header)".to_string(),
    }
}
