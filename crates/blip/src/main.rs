mod client;

use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use blip_server::ShortCode;
use client::{BlipClient, Created, Opened};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "blip", about = "blip: short-lived links, pastes, images and secrets", version)]
struct Cli {
    /// blip server URL (default: http://localhost:8080 or $BLIP_SERVER)
    #[arg(long, env = "BLIP_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Bearer token for admin commands ($BLIP_ADMIN_KEY)
    #[arg(long, env = "BLIP_ADMIN_KEY", hide_env_values = true)]
    admin_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the blip HTTP server
    Serve {
        /// Port to listen on (default: $BLIP_PORT or 8080)
        #[arg(long, env = "BLIP_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BLIP_HOST or 0.0.0.0)
        #[arg(long, env = "BLIP_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Shorten a URL
    Link {
        url: String,
        /// Seal the target; only holders of the full link can read it
        #[arg(long)]
        encrypt: bool,
        /// Delete after the first visit
        #[arg(long)]
        once: bool,
    },
    /// Share text from a file or stdin
    Paste {
        /// File to read, or `-` for stdin (default)
        #[arg(default_value = "-")]
        file: String,
        /// Language tag for syntax highlighting
        #[arg(long)]
        lang: Option<String>,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        once: bool,
    },
    /// Share a secret; always sealed and always burned on first read
    Secret {
        /// Secret text, or `-` for stdin
        text: String,
    },
    /// Share an image file
    Image {
        file: PathBuf,
        #[arg(long)]
        encrypt: bool,
        #[arg(long)]
        once: bool,
    },
    /// Fetch what a share link points at, decrypting locally if it has a key
    Open {
        link: String,
        /// Where to write an image (default: <code>.<ext> in the current dir)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show what a code holds without consuming it
    Peek { code: String },
    /// Delete an item (admin)
    Delete { code: String },
    /// Live item counts by kind (admin)
    Stats,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // An optional .env in the working directory feeds the env fallbacks.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            return Err(e).context("load .env");
        }
    }

    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BLIP_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let client = BlipClient::new(&cli.server, cli.admin_key)?;

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Link { url, encrypt, once } => {
            let (sealed, key) = maybe_seal(url.as_bytes(), encrypt)?;
            let target = sealed.unwrap_or(url);
            let created = client.create_link(&target, encrypt, once).await?;
            print_created(&created, key.as_ref());
            Ok(())
        }

        Commands::Paste {
            file,
            lang,
            encrypt,
            once,
        } => {
            let content = read_input(&file)?;
            let text = String::from_utf8(content).context("paste must be UTF-8 text")?;
            let (sealed, key) = maybe_seal(text.as_bytes(), encrypt)?;
            let body = sealed.unwrap_or(text);
            let created = client
                .create_paste(&body, lang.as_deref(), encrypt, once)
                .await?;
            print_created(&created, key.as_ref());
            Ok(())
        }

        Commands::Secret { text } => {
            let plaintext = if text == "-" {
                read_input("-")?
            } else {
                text.into_bytes()
            };
            let (envelope, key) = client::seal(&plaintext)?;
            let created = client.create_secret(&envelope).await?;
            print_created(&created, Some(&key));
            Ok(())
        }

        Commands::Image {
            file,
            encrypt,
            once,
        } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_owned();
            let (upload, key) = if encrypt {
                let (envelope, key) = client::seal(&bytes)?;
                (client::envelope_bytes(&envelope)?, Some(key))
            } else {
                (bytes, None)
            };
            let created = client.create_image(upload, &file_name, encrypt, once).await?;
            print_created(&created, key.as_ref());
            Ok(())
        }

        Commands::Open { link, output } => cmd_open(&client, &link, output.as_deref()).await,

        Commands::Peek { code } => {
            let code = parse_code(&code)?;
            let summary = client.peek(&code).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }

        Commands::Delete { code } => {
            let code = parse_code(&code)?;
            client.delete(&code).await?;
            println!("✓ deleted {code}");
            Ok(())
        }

        Commands::Stats => {
            let stats = client.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = blip_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };

    blip_server::run(cfg).await
}

async fn cmd_open(client: &BlipClient, link: &str, output: Option<&Path>) -> Result<()> {
    match client.open(link).await? {
        Opened::Link(url) => println!("{url}"),
        Opened::Paste(bytes) | Opened::Secret(bytes) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            if !bytes.ends_with(b"\n") && stdout.is_terminal() {
                stdout.write_all(b"\n")?;
            }
        }
        Opened::Image {
            content_type,
            bytes,
        } => {
            let path = match output {
                Some(p) => p.to_owned(),
                None => {
                    let (_, code) = client::classify(&reqwest::Url::parse(
                        link.split('#').next().unwrap_or(link),
                    )?)?;
                    PathBuf::from(blip_server::images::file_name_for(
                        &code,
                        &content_type,
                        false,
                    ))
                }
            };
            std::fs::write(&path, &bytes).with_context(|| format!("write {}", path.display()))?;
            println!("saved {} ({content_type}, {} bytes)", path.display(), bytes.len());
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn maybe_seal(
    plaintext: &[u8],
    encrypt: bool,
) -> Result<(Option<String>, Option<blip_server::crypto::EnvelopeKey>)> {
    if !encrypt {
        return Ok((None, None));
    }
    let (envelope, key) = client::seal(plaintext)?;
    Ok((Some(envelope), Some(key)))
}

fn print_created(created: &Created, key: Option<&blip_server::crypto::EnvelopeKey>) {
    debug!(short = %created.short, expires_at = created.expires_at, "created");
    println!("{}", created.share_link(key));
}

fn parse_code(code: &str) -> Result<ShortCode> {
    ShortCode::parse(code).with_context(|| format!("invalid code: {code}"))
}

fn read_input(source: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    if source == "-" {
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("read stdin")?;
    } else {
        buf = std::fs::read(source).with_context(|| format!("read {source}"))?;
    }
    if buf.is_empty() {
        anyhow::bail!("nothing to share: input is empty");
    }
    Ok(buf)
}
