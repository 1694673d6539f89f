use crate::cli::cli::{Cli, Commands, FieldArg, SortArg};
use crate::cli::handlers::Handlers;
use crate::config::app_config::Config;
use crate::vault::models::EntryField;
use crate::vault::service::VaultSettings;
use crate::vault::store::SortKey;
use clap::Parser;
use std::path::PathBuf;

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::create(cli.path.map(PathBuf::from))?;
    tracing::debug!(vault = %config.vault_path.display(), "configuration resolved");

    let handlers = match &cli.command {
        Commands::Watch => {
            let mut settings = VaultSettings::from(&config);
            settings.worker.sync_on_start = true;
            Handlers::with_settings(config, settings)
        }
        _ => Handlers::new(config),
    };

    let outcome = dispatch(&handlers, cli.command).await;
    let finished = handlers.finish().await;
    outcome?;
    finished
}

async fn dispatch(handlers: &Handlers, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { user } => handlers.handle_init(user).await,
        Commands::Passwd { user } => handlers.handle_passwd(user).await,
        Commands::Add { label, user, tags } => handlers.handle_add(label, user, tags).await,
        Commands::List {
            tag,
            query,
            show_users,
            json,
            sort,
        } => {
            let sort = match sort {
                SortArg::Insertion => SortKey::Insertion,
                SortArg::Label => SortKey::Label,
            };
            handlers.handle_list(tag, query, show_users, json, sort).await
        }
        Commands::Show {
            key,
            reveal_password,
        } => handlers.handle_show(&key, reveal_password).await,
        Commands::Edit {
            key,
            label,
            user,
            tags,
            password,
        } => handlers.handle_edit(&key, label, user, tags, password).await,
        Commands::Rm { key, yes } => handlers.handle_rm(&key, yes).await,
        Commands::Copy { key, field, ttl } => {
            let field = match field {
                FieldArg::Label => EntryField::Label,
                FieldArg::User => EntryField::Username,
                FieldArg::Password => EntryField::Password,
            };
            handlers.handle_copy(&key, field, ttl).await
        }
        Commands::Sync => handlers.handle_sync().await,
        Commands::Watch => handlers.handle_watch().await,
        Commands::Conflicts { json } => handlers.handle_conflicts(json).await,
        Commands::Header => handlers.handle_header().await,
    }
}
