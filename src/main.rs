use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mailbridge::mail::imap::INBOX;
use mailbridge::{
    Config, ConfigUpdate, MailClient, OutboundAttachment, OutboundMessage, SearchCriteria, ServerSettings,
};

#[derive(Parser)]
#[command(name = "mailbridge", version, about = "IMAP, POP3 and SMTP from one command line")]
struct Cli {
    /// TOML settings file (default: <config dir>/mailbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Smtp,
    Imap,
    Pop3,
}

/// Fields left out keep their current value in the settings file.
#[derive(Args)]
struct ServerArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    secure: Option<bool>,
}

impl ServerArgs {
    fn over(self, base: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.or(base.host),
            port: self.port.or(base.port),
            user: self.user.or(base.user),
            password: self.password.or(base.password),
            secure: self.secure.or(base.secure),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Change one protocol's settings and save them to the settings file
    Configure {
        #[arg(value_enum)]
        protocol: Target,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// IMAP folder tree
    Mailboxes,
    /// Newest messages of an IMAP mailbox
    Inbox {
        #[arg(long, default_value = INBOX)]
        mailbox: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Search INBOX; no filters lists everything
    Search {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        since: Option<NaiveDate>,
        /// YYYY-MM-DD
        #[arg(long)]
        before: Option<NaiveDate>,
        #[arg(long)]
        unseen: bool,
    },
    MarkRead {
        id: u32,
    },
    Delete {
        id: u32,
    },
    /// Newest messages over POP3
    Pop3Inbox {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Pop3Info,
    Pop3Retrieve {
        number: u32,
    },
    Pop3Delete {
        number: u32,
    },
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        cc: Option<String>,
        #[arg(long)]
        bcc: Option<String>,
        #[arg(long, default_value = "")]
        subject: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        html: Option<String>,
        /// File to attach; repeatable
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn attachment(path: &Path) -> Result<OutboundAttachment> {
    let content = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok(OutboundAttachment {
        filename,
        content_type: "application/octet-stream".to_string(),
        content,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailbridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let (config, created, path) = Config::load_or_create(cli.config.as_deref())?;
    if created {
        info!(path = %path.display(), "wrote settings template");
    }
    let client = MailClient::new(&config);

    match cli.command {
        Command::Configure { protocol, server } => {
            let current = client.current_config();
            let update = match protocol {
                Target::Smtp => ConfigUpdate { smtp: Some(server.over(current.smtp)), ..Default::default() },
                Target::Imap => ConfigUpdate { imap: Some(server.over(current.imap)), ..Default::default() },
                Target::Pop3 => ConfigUpdate { pop3: Some(server.over(current.pop3)), ..Default::default() },
            };
            let ack = client.configure(update);
            client
                .current_config()
                .save_to(&path)
                .with_context(|| format!("saving {}", path.display()))?;
            info!(path = %path.display(), "settings saved");
            print(&ack)
        }
        Command::Mailboxes => print(&client.imap().list_mailboxes().await?),
        Command::Inbox { mailbox, limit } => print(&client.imap().list_messages(&mailbox, limit).await?),
        Command::Search { from, to, subject, body, since, before, unseen } => {
            let criteria = SearchCriteria {
                from,
                to,
                subject,
                body,
                since,
                before,
                unseen: unseen.then_some(true),
            };
            print(&client.imap().search(&criteria).await?)
        }
        Command::MarkRead { id } => print(&client.imap().mark_read(id).await?),
        Command::Delete { id } => print(&client.imap().delete_message(id).await?),
        Command::Pop3Inbox { limit } => print(&client.pop3().list_messages(limit).await?),
        Command::Pop3Info => print(&client.pop3().mailbox_info().await?),
        Command::Pop3Retrieve { number } => print(&client.pop3().retrieve_one(number).await?),
        Command::Pop3Delete { number } => print(&client.pop3().delete_message(number).await?),
        Command::Send { to, from, cc, bcc, subject, text, html, attachments } => {
            let message = OutboundMessage {
                from,
                to,
                cc,
                bcc,
                subject,
                text,
                html,
                attachments: attachments.iter().map(|p| attachment(p)).collect::<Result<_>>()?,
                ..Default::default()
            };
            print(&client.smtp().send(&message).await?)
        }
    }
}
