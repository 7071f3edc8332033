//! Command-line surface: argument definitions and their execution.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use notesync_core::config::CONFIG_PATH;
use notesync_core::context::SYNC_KEY_ENV;
use notesync_core::{
    BackupDocument, DirectoryDocumentStore, Folder, HybridClock, NoteEdit, PushOutcome,
    SyncConfig, SyncContext, SyncEngine, SyncKey, UNSORTED_FOLDER_ID,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::identity;
use crate::native_fs::NativeFs;

pub const DEVICE_ID_ENV: &str = "NOTESYNC_DEVICE_ID";

/// Directory under the mirror root holding one subdirectory per collection.
pub const MIRROR_ROOT: &str = "mirror";

pub type Engine = SyncEngine<NativeFs, DirectoryDocumentStore<NativeFs>>;

#[derive(Parser, Debug)]
#[command(name = "notesync")]
#[command(about = "Local-first notes with folder sync")]
pub struct Cli {
    /// Directory holding this device's notes and sync state
    #[arg(short, long, default_value = ".")]
    pub data: PathBuf,

    /// Shared directory used as the remote mirror (defaults to the data directory)
    #[arg(short, long)]
    pub mirror: Option<PathBuf>,

    /// Shared secret selecting which notes to sync
    #[arg(long, env = SYNC_KEY_ENV, hide_env_values = true)]
    pub sync_key: String,

    /// Device ID (16 hex chars; generated and stored if not provided)
    #[arg(long, env = DEVICE_ID_ENV)]
    pub device_id: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage folders
    #[command(subcommand)]
    Folder(FolderCommand),
    /// Manage notes
    #[command(subcommand)]
    Note(NoteCommand),
    /// Show folders and their notes
    Ls {
        /// Include deleted entities
        #[arg(long)]
        all: bool,
    },
    /// Write a backup of every folder and note
    Export {
        /// Output file ("-" for stdout)
        file: PathBuf,
    },
    /// Replace local folders and notes with a backup
    Import { file: PathBuf },
    /// Catch up with the mirror and push local changes
    Sync {
        /// Keep running and apply remote changes as they arrive
        #[arg(long)]
        watch: bool,
    },
    /// Remove old tombstones and prune the change log
    Compact,
    /// Show device, collection and pending pushes
    Status,
}

#[derive(Subcommand, Debug)]
pub enum FolderCommand {
    Add { name: String },
    Rename { id: Uuid, name: String },
    /// Move a folder to a new position
    Reorder { id: Uuid, position: f64 },
    Rm { id: Uuid },
}

#[derive(Args, Debug)]
pub struct NoteFields {
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub body: Option<String>,
    /// Replace the tags (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum NoteCommand {
    Add {
        /// Folder to file the note under (Unsorted if omitted)
        #[arg(long)]
        folder: Option<Uuid>,
        #[command(flatten)]
        fields: NoteFields,
    },
    Edit {
        id: Uuid,
        #[command(flatten)]
        fields: NoteFields,
    },
    Mv { id: Uuid, folder: Uuid },
    Rm { id: Uuid },
}

impl Cli {
    fn mirror_dir(&self) -> PathBuf {
        self.mirror.clone().unwrap_or_else(|| self.data.clone())
    }
}

/// Open the engine for the directories named on the command line.
pub async fn open_engine(cli: &Cli) -> Result<Engine> {
    let fs = NativeFs::new(&cli.data);
    let key = SyncKey::new(cli.sync_key.as_str()).context("Invalid sync key")?;
    let device_id = identity::device_id(&fs, cli.device_id.as_deref()).await?;
    let config = SyncConfig::load(&fs, CONFIG_PATH)
        .await
        .with_context(|| format!("Failed to load {}", CONFIG_PATH))?;

    let remote = DirectoryDocumentStore::new(NativeFs::new(cli.mirror_dir()), MIRROR_ROOT);
    let ctx = SyncContext::new(device_id, key.clone(), HybridClock::system());
    let mut engine = SyncEngine::open(fs.clone(), remote, ctx, config).await?;

    if identity::key_switched(&fs, &key).await? {
        info!("Sync key changed, re-pushing everything to the new collection");
        engine.change_sync_key(key.clone()).await?;
    }
    identity::remember_collection(&fs, &key).await?;
    Ok(engine)
}

pub async fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let mut engine = open_engine(&cli).await?;

    match cli.command {
        Command::Folder(command) => run_folder(&mut engine, command, out).await?,
        Command::Note(command) => run_note(&mut engine, command, out).await?,
        Command::Ls { all } => list(&engine, all, out)?,
        Command::Export { file } => {
            let text = engine.export_backup().to_json()?;
            if file.as_os_str() == "-" {
                writeln!(out, "{}", text)?;
            } else {
                tokio::fs::write(&file, text)
                    .await
                    .with_context(|| format!("Failed to write {}", file.display()))?;
                info!("Exported backup to {}", file.display());
            }
        }
        Command::Import { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let doc = BackupDocument::parse(&text)?;
            let delta = engine.import_backup(&doc).await?;
            writeln!(
                out,
                "Imported {} folder(s) and {} note(s): {} added, {} updated, {} removed",
                doc.folders.len(),
                doc.notes.len(),
                delta.added.len(),
                delta.updated.len(),
                delta.removed.len()
            )?;
        }
        Command::Sync { watch } => sync(&mut engine, watch, out).await?,
        Command::Compact => {
            let report = engine.compact().await?;
            writeln!(
                out,
                "Removed {} tombstone(s) and {} log record(s)",
                report.tombstones, report.log_records
            )?;
            if report.deferred > 0 {
                warn!(
                    "{} tombstone(s) kept because the mirror could not remove them",
                    report.deferred
                );
            }
        }
        Command::Status => {
            let ctx = engine.context();
            writeln!(out, "device:     {}", ctx.device_id)?;
            writeln!(out, "collection: {}", engine.mirror().collection())?;
            writeln!(out, "pending:    {}", engine.pending_pushes())?;
            writeln!(out, "log:        {} record(s)", engine.change_log().len())?;
        }
    }
    Ok(())
}

async fn run_folder(engine: &mut Engine, command: FolderCommand, out: &mut impl Write) -> Result<()> {
    match command {
        FolderCommand::Add { name } => {
            let id = engine.create_folder(name).await?;
            writeln!(out, "{}", id)?;
        }
        FolderCommand::Rename { id, name } => {
            engine.rename_folder(id, name).await?;
        }
        FolderCommand::Reorder { id, position } => {
            if !position.is_finite() {
                bail!("Position must be a finite number");
            }
            engine.reorder_folder(id, position).await?;
        }
        FolderCommand::Rm { id } => {
            engine.delete_folder(id).await?;
        }
    }
    Ok(())
}

async fn run_note(engine: &mut Engine, command: NoteCommand, out: &mut impl Write) -> Result<()> {
    match command {
        NoteCommand::Add { folder, fields } => {
            let id = engine
                .create_note(
                    folder.unwrap_or(UNSORTED_FOLDER_ID),
                    fields.title.unwrap_or_default(),
                    fields.body.unwrap_or_default(),
                    fields.tags,
                )
                .await?;
            writeln!(out, "{}", id)?;
        }
        NoteCommand::Edit { id, fields } => {
            let edit = NoteEdit {
                title: fields.title,
                body: fields.body,
                tags: (!fields.tags.is_empty())
                    .then(|| notesync_core::tagging::normalize_tags(&fields.tags)),
            };
            if edit.is_empty() {
                bail!("Nothing to edit: pass --title, --body or --tag");
            }
            engine.edit_note(id, edit).await?;
        }
        NoteCommand::Mv { id, folder } => {
            engine.move_note(id, folder).await?;
        }
        NoteCommand::Rm { id } => {
            engine.delete_note(id).await?;
        }
    }
    Ok(())
}

fn list(engine: &Engine, all: bool, out: &mut impl Write) -> Result<()> {
    let snapshot = engine.snapshot();
    let mut folders: Vec<&Folder> = snapshot
        .folders
        .iter()
        .filter(|f| all || !f.deleted)
        .collect();
    folders.sort_by(|a, b| {
        a.order_hint
            .total_cmp(&b.order_hint)
            .then_with(|| a.name.cmp(&b.name))
    });

    for folder in folders {
        let marker = if folder.deleted { " (deleted)" } else { "" };
        writeln!(out, "{}  {}{}", folder.id, folder.name, marker)?;
        for note in snapshot
            .notes
            .iter()
            .filter(|n| n.folder_id == folder.id && (all || !n.deleted))
        {
            let marker = if note.deleted { " (deleted)" } else { "" };
            if note.tags.is_empty() {
                writeln!(out, "  {}  {}{}", note.id, note.title, marker)?;
            } else {
                let tags: Vec<&str> = note.tags.iter().map(String::as_str).collect();
                writeln!(out, "  {}  {} [{}]{}", note.id, note.title, tags.join(", "), marker)?;
            }
        }
    }
    Ok(())
}

async fn sync(engine: &mut Engine, watch: bool, out: &mut impl Write) -> Result<()> {
    let report = engine.connect().await?;
    writeln!(
        out,
        "Pulled {} record(s): {} applied, {} pushed back",
        report.received, report.applied, report.pushed_back
    )?;
    if let PushOutcome::Retryable(reason) = engine.flush().await? {
        warn!("Mirror unavailable, {} change(s) stay queued: {}", engine.pending_pushes(), reason);
    }
    writeln!(out, "{} change(s) pending", engine.pending_pushes())?;

    if !watch {
        engine.sign_out();
        return Ok(());
    }

    info!("Watching for remote changes. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            next = engine.process_next() => {
                match next? {
                    Some(report) if report.applied > 0 => {
                        info!(applied = report.applied, "Applied remote changes");
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }
    engine.sign_out();
    Ok(())
}
