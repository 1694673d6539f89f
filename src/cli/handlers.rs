use crate::config::app_config::Config;
use crate::error::VaultError;
use crate::cryptography::primitives::{parse_header, AEAD_AES256GCM, KDF_ARGON2ID};
use crate::filesystem::clipboard::environment_warning;
use crate::sync::engine::SyncReport;
use crate::vault::events::VaultEvent;
use crate::vault::models::{EntryField, EntryId, EntryPatch, PasswordEntry};
use crate::vault::service::{Vault, VaultSettings};
use crate::vault::store::SortKey;
use anyhow::{anyhow, bail, Context, Result};
use inquire::{Confirm, Password, Text};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::spawn_blocking;
use uuid::Uuid;

/// Run blocking vault work (Argon2, file I/O) off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|_| anyhow!("task join error"))?
}

fn master_username() -> Result<String> {
    match env::var("BLUEKEY_USER") {
        Ok(u) => Ok(u),
        Err(_) => Ok(Text::new("Master username").prompt()?),
    }
}

fn master_password() -> Result<SecretString> {
    match env::var("BLUEKEY_PASSWORD") {
        Ok(pw) => Ok(SecretString::from(pw)),
        Err(_) => Ok(SecretString::from(
            Password::new("Master password")
                .without_confirmation()
                .prompt()?,
        )),
    }
}

/// A new password from `env_key`, or prompted twice.
fn new_password(env_key: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = env::var(env_key) {
        return Ok(SecretString::from(pw));
    }
    let pw1 = Password::new(prompt).without_confirmation().prompt()?;
    let pw2 = Password::new("Confirm password")
        .without_confirmation()
        .prompt()?;
    if pw1 != pw2 {
        bail!("Passwords do not match");
    }
    Ok(SecretString::from(pw1))
}

pub struct Handlers {
    config: Config,
    vault: Arc<Vault>,
}

impl Handlers {
    pub fn new(config: Config) -> Self {
        let vault = Arc::new(Vault::from_config(&config));
        Self { config, vault }
    }

    pub fn with_settings(config: Config, settings: VaultSettings) -> Self {
        let vault = Arc::new(Vault::from_config_with(&config, settings));
        Self { config, vault }
    }

    /// Verify the master credential and open the vault. Returns the pair used.
    async fn unlock(&self) -> Result<(String, SecretString)> {
        let vault = self.vault.clone();
        if !blocking(move || Ok(vault.has_credential()?)).await? {
            bail!(
                "no vault at {} (run `bluekey init` first)",
                self.config.vault_path.display()
            );
        }
        let username = master_username()?;
        let password = master_password()?;
        let vault = self.vault.clone();
        let (user, pw) = (username.clone(), password.clone());
        let accepted = blocking(move || Ok(vault.verify(&user, pw)?)).await?;
        if !accepted {
            bail!("invalid master credentials");
        }
        Ok((username, password))
    }

    /// Flush pending writes and stop background work.
    pub async fn finish(&self) -> Result<()> {
        self.vault.lock().await?;
        Ok(())
    }

    /// Resolve an exact id, a unique label or a unique id prefix.
    fn resolve(&self, key: &str) -> Result<EntryId> {
        if let Ok(id) = Uuid::parse_str(key) {
            return Ok(id);
        }
        let entries = self.vault.list_entries()?;
        let by_label: Vec<EntryId> = entries
            .iter()
            .filter(|(_, e)| e.label == key)
            .map(|(id, _)| *id)
            .collect();
        match by_label.as_slice() {
            [id] => return Ok(*id),
            [] => {}
            _ => bail!("label '{key}' matches {} entries; use the id", by_label.len()),
        }
        let by_prefix: Vec<EntryId> = entries
            .iter()
            .filter(|(id, _)| id.to_string().starts_with(key))
            .map(|(id, _)| *id)
            .collect();
        match by_prefix.as_slice() {
            [id] => Ok(*id),
            [] => bail!("no entry matches '{key}'"),
            _ => bail!("id prefix '{key}' is ambiguous"),
        }
    }

    pub async fn handle_init(&self, user: Option<String>) -> Result<()> {
        let username = match user {
            Some(u) => u,
            None => master_username()?,
        };
        let password = new_password("BLUEKEY_PASSWORD", "Master password")?;
        let vault = self.vault.clone();
        blocking(move || Ok(vault.initialize(&username, password)?)).await?;
        println!(
            "✅ Initialized encrypted vault at {}",
            self.config.vault_path.display()
        );
        Ok(())
    }

    pub async fn handle_passwd(&self, user: Option<String>) -> Result<()> {
        let (current_user, current) = self.unlock().await?;
        let new_user = user.unwrap_or(current_user);
        let new_pw = new_password("BLUEKEY_NEW_PASSWORD", "New master password")?;
        self.vault
            .change_credential(&current, &new_user, new_pw)
            .await?;
        println!("🔑 Master credential changed; vault re-encrypted.");
        Ok(())
    }

    pub async fn handle_add(
        &self,
        label: Option<String>,
        user: Option<String>,
        tags: Vec<String>,
    ) -> Result<()> {
        self.unlock().await?;
        let label = match label {
            Some(l) => l,
            None => Text::new("Label").prompt()?,
        };
        let username = match user {
            Some(u) => u,
            None => Text::new("Username (optional)").with_default("").prompt()?,
        };
        let password = match env::var("BLUEKEY_ENTRY_PASSWORD") {
            Ok(pw) => pw,
            Err(_) => Password::new("Password").prompt()?,
        };
        let entry = PasswordEntry::new(label, &username, &password).with_tags(tags);
        let id = self.vault.add_entry(entry)?;
        println!("✅ Entry saved ({id}).");
        Ok(())
    }

    pub async fn handle_list(
        &self,
        tag: Option<String>,
        query: Option<String>,
        show_users: bool,
        json_mode: bool,
        sort: SortKey,
    ) -> Result<()> {
        self.unlock().await?;
        let mut entries = self.vault.list_sorted(sort)?;
        if let Some(q) = query {
            entries.retain(|(_, e)| e.matches(&q));
        }
        if let Some(t) = tag {
            entries.retain(|(_, e)| e.tags.iter().any(|x| x.eq_ignore_ascii_case(&t)));
        }

        if json_mode {
            let items: Vec<serde_json::Value> = entries
                .iter()
                .map(|(id, e)| {
                    let mut item = json!({"id": id, "label": e.label, "tags": e.tags});
                    let user = e.username.expose_secret();
                    if show_users && !user.is_empty() {
                        item["username"] = json!(user);
                    }
                    item
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
            return Ok(());
        }

        if entries.is_empty() {
            println!("(empty)");
            return Ok(());
        }
        for (id, e) in entries {
            let id_text = id.to_string();
            let short = &id_text[..8];
            let user = e.username.expose_secret();
            if show_users && !user.is_empty() {
                println!("{short}  {}\t{user}", e.label);
            } else {
                println!("{short}  {}", e.label);
            }
        }
        Ok(())
    }

    pub async fn handle_show(&self, key: &str, reveal_password: bool) -> Result<()> {
        self.unlock().await?;
        let id = self.resolve(key)?;
        let stored = self.vault.get_stored(id)?;
        let entry = &stored.entry;
        println!("Id:       {id}");
        println!("Label:    {}", entry.label);
        let user = entry.username.expose_secret();
        println!("Username: {}", if user.is_empty() { "(none)" } else { user });
        if entry.tags.is_empty() {
            println!("Tags:     (none)");
        } else {
            println!("Tags:     {}", entry.tags.join(", "));
        }
        println!("Revision: {}", stored.revision);
        if let Some(original) = stored.conflict_of {
            println!("Conflict: copy of {original}");
        }
        if reveal_password {
            println!("Password: {}", entry.password.expose_secret());
        } else {
            println!("Password: ******** (use --reveal-password to show)");
        }
        Ok(())
    }

    pub async fn handle_edit(
        &self,
        key: &str,
        label: Option<String>,
        user: Option<String>,
        tags: Option<Vec<String>>,
        prompt_password: bool,
    ) -> Result<()> {
        self.unlock().await?;
        let id = self.resolve(key)?;
        let password = if prompt_password {
            Some(match env::var("BLUEKEY_ENTRY_PASSWORD") {
                Ok(pw) => SecretString::from(pw),
                Err(_) => SecretString::from(Password::new("New password").prompt()?),
            })
        } else {
            None
        };
        let patch = EntryPatch {
            label,
            username: user.map(SecretString::from),
            password,
            tags,
        };
        self.vault.update_entry(id, patch)?;
        println!("✏️ Entry updated.");
        Ok(())
    }

    pub async fn handle_rm(&self, key: &str, yes: bool) -> Result<()> {
        self.unlock().await?;
        let id = self.resolve(key)?;
        let label = self.vault.get_entry(id)?.label;
        if !yes {
            let msg = format!("Delete entry '{label}' ?");
            if !Confirm::new(&msg).with_default(false).prompt()? {
                println!("❎ Deletion cancelled.");
                return Ok(());
            }
        }
        self.vault.delete_entry(id)?;
        println!("🗑️ Entry '{label}' removed.");
        Ok(())
    }

    pub async fn handle_copy(
        &self,
        key: &str,
        field: EntryField,
        ttl_override: Option<u64>,
    ) -> Result<()> {
        self.unlock().await?;
        let id = self.resolve(key)?;
        if let Some(warn) = environment_warning() {
            eprintln!("⚠️ {warn}");
        }
        let ttl = ttl_override
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.clipboard_ttl());
        let handle = self.vault.copy_field(id, field, Some(ttl))?;
        if handle.is_pending_clear() {
            eprintln!(
                "📋 Copied; clipboard clears in {}s (Ctrl-C clears now).",
                ttl.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            self.vault
                .clipboard()
                .shutdown()
                .context("Failed to clear clipboard")?;
        } else {
            eprintln!("📋 Copied.");
        }
        Ok(())
    }

    fn print_report(report: &SyncReport) {
        println!(
            "🔄 Sync {}: pulled {}, pushed {}, conflicts {}",
            report.phase(),
            report.pulled,
            report.pushed,
            report.conflicts.len()
        );
        for c in &report.conflicts {
            let copy = c
                .conflicted_copy
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  ⚠️ {}: kept {:?} ({} vs {}), conflicted copy {copy}",
                VaultError::from(c),
                c.winner,
                c.local_revision,
                c.remote_revision
            );
        }
        for id in &report.rejected {
            println!("  ⏸️ {id} not synced: password is blank");
        }
    }

    pub async fn handle_sync(&self) -> Result<()> {
        if !self.vault.sync_enabled() {
            bail!("no remote configured (set remote_path or BLUEKEY_REMOTE_PATH)");
        }
        self.unlock().await?;
        let report = self.vault.sync_now().await?;
        Self::print_report(&report);
        if let Some(e) = report.error {
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn handle_watch(&self) -> Result<()> {
        if !self.vault.sync_enabled() {
            bail!("no remote configured (set remote_path or BLUEKEY_REMOTE_PATH)");
        }
        let mut events = self.vault.subscribe();
        self.unlock().await?;
        eprintln!("👀 Syncing in the background; Ctrl-C to stop.");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(VaultEvent::SyncStatusChanged { phase, conflicts }) => {
                        println!("sync: {phase} ({} conflicts)", conflicts.len());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => tracing::debug!(missed = n, "event stream lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    pub async fn handle_conflicts(&self, json_mode: bool) -> Result<()> {
        self.unlock().await?;
        let conflicts = self.vault.conflicts()?;
        if json_mode {
            let items: Vec<serde_json::Value> = conflicts
                .iter()
                .map(|c| json!({"id": c.id, "label": c.entry.label, "conflict_of": c.conflict_of}))
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
            return Ok(());
        }
        if conflicts.is_empty() {
            println!("(no conflicts)");
        }
        for c in conflicts {
            let original = c.conflict_of.map(|id| id.to_string()).unwrap_or_default();
            println!("{}  {}  (copy of {original})", c.id, c.entry.label);
        }
        Ok(())
    }

    pub async fn handle_header(&self) -> Result<()> {
        let path = self.config.vault_path.clone();
        let bytes = blocking(move || {
            std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
        })
        .await?;
        let (hdr, _off) = parse_header(&bytes).map_err(|e| anyhow!("Failed to parse header: {e}"))?;
        let kdf = if hdr.kdf_id == KDF_ARGON2ID { "Argon2id" } else { "Unknown" };
        let aead = if hdr.aead_id == AEAD_AES256GCM { "AES-256-GCM" } else { "Unknown" };
        println!("BLKY header:");
        println!("  version: {}", hdr.version);
        println!("  kdf: {} ({})", kdf, hdr.kdf_id);
        println!("  aead: {} ({})", aead, hdr.aead_id);
        println!("  argon2 m_cost_kib: {}", hdr.params.m_cost_kib);
        println!("  argon2 t_cost: {}", hdr.params.t_cost);
        println!("  argon2 p_lanes: {}", hdr.params.p_lanes);
        println!("  salt: {}", hex::encode(hdr.salt));
        println!("  nonce: {}", hex::encode(hdr.nonce));
        Ok(())
    }
}
