// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use fvde_core::dmsetup::{mapper_name, write_table_entry, TableEntry};
use fvde_core::dump::{DumpOptions, Dumper, SourceGeometry};
use fvde_core::keyring::{add_logon_key, KeyringTarget};
use fvde_core::report;
use fvde_core::source::RangeReader;
use fvde_core::unlock::{Credentials, Unlocker};
use fvde_core::walker::{walk_volume_group, ProcessingOrder, WalkOptions};
use fvde_core::AbortFlag;
use log::{debug, info, LevelFilter};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

/// External unlock backends plug in here.
///
/// Deriving volume master keys from credentials and decrypting the
/// encrypted metadata happens outside this workspace. Without a backend,
/// commands that need unlocked logical volumes report them as locked.
fn unlock_backend() -> Option<Box<dyn Unlocker>> {
    None
}

struct CommandContext {
    abort: AbortFlag,
    verbose: bool,
}

trait CliCommand {
    fn run(&self, context: &CommandContext) -> Result<()>;
}

#[derive(Args)]
struct CredentialArgs {
    /// Path of the EncryptedRoot.plist.wipekey file.
    #[arg(short = 'e', long)]
    encrypted_root_plist: Option<PathBuf>,

    /// Volume master key, 32 base16 characters.
    #[arg(short = 'k', long = "key")]
    volume_master_key: Option<String>,

    /// Password.
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Recovery password.
    #[arg(short = 'r', long)]
    recovery_password: Option<String>,
}

impl CredentialArgs {
    fn credentials(&self) -> Result<Credentials> {
        let volume_master_key = self
            .volume_master_key
            .as_deref()
            .map(Credentials::parse_volume_master_key)
            .transpose()?;

        Ok(Credentials {
            password: self.password.clone(),
            recovery_password: self.recovery_password.clone(),
            volume_master_key,
            encrypted_root_plist: self.encrypted_root_plist.clone(),
        })
    }
}

#[derive(Args)]
struct VolumeArgs {
    /// Volume offset in bytes.
    #[arg(short = 'o', long, default_value_t = 0, allow_negative_numbers = true)]
    offset: i64,

    /// Source files or block devices, one per physical volume.
    #[arg(required = true)]
    sources: Vec<PathBuf>,
}

impl VolumeArgs {
    fn volume_offset(&self) -> Result<u64> {
        // Reject negative offsets instead of wrapping them around.
        u64::try_from(self.offset)
            .map_err(|_| anyhow::anyhow!("volume offset {} is negative", self.offset))
    }

    /// Open the first source windowed at the volume offset.
    fn open_primary(&self) -> Result<RangeReader<BufReader<File>>> {
        let path = &self.sources[0];
        let file = File::open(path)
            .map_err(|err| anyhow::anyhow!("unable to open {}: {err}", path.display()))?;

        Ok(RangeReader::new(BufReader::new(file), self.volume_offset()?)?)
    }
}

#[derive(Parser)]
struct Check {
    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(flatten)]
    volume: VolumeArgs,

    /// Metadata processing order: ascending, descending or physical.
    #[arg(long, default_value = "ascending")]
    order: String,

    /// Stop after processing metadata block N.
    #[arg(long)]
    stop_at_block: Option<u32>,

    /// Stop after processing transaction ID.
    #[arg(long)]
    stop_at_transaction: Option<u64>,

    /// Look up a Linux 512-byte sector.
    #[arg(long)]
    lookup_linux_sector: Option<u64>,

    /// Dump the full allocation map instead of the summary.
    #[arg(long)]
    dump_allocation_map: bool,

    /// Output in JSON format.
    #[arg(long)]
    json: bool,

    /// Quiet mode, only show errors.
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Unattended mode, disables user interaction.
    #[arg(short = 'u', long)]
    unattended: bool,
}

impl CliCommand for Check {
    fn run(&self, context: &CommandContext) -> Result<()> {
        let order: ProcessingOrder = self.order.parse()?;
        let credentials = self.credentials.credentials()?;
        let progress = !self.quiet && !self.json;

        if self.unattended {
            debug!("unattended mode: interactive credential prompts disabled");
        }
        if progress {
            println!("Opening volume...");
        }
        let mut source = self.volume.open_primary()?;
        let geometry = SourceGeometry::read_from(&mut source, &context.abort)?;

        info!(
            "best metadata copy {} (transaction {})",
            geometry.best_metadata_index + 1,
            geometry.highest_transaction
        );

        let unlocker = unlock_backend().ok_or(fvde_core::Error::NoUnlockBackend)?;
        let group = unlocker.unlock(&mut source, &credentials)?;

        let descriptor = geometry.encrypted_metadata_descriptor();
        let options = WalkOptions {
            order,
            stop_at_block: self.stop_at_block,
            stop_at_transaction: self.stop_at_transaction,
        };
        let walk = walk_volume_group(
            &group,
            &geometry.header,
            descriptor.as_ref(),
            options,
            &context.abort,
        )?;

        if progress {
            println!("Volume opened successfully.");
            println!("Physical volumes: {}", walk.state.physical_volumes().len());
            println!("Logical volumes: {}", walk.state.logical_volumes().len());
            println!("Block size: {} bytes", walk.state.block_size());
        }

        let mut stdout = io::stdout().lock();

        if let Some(sector) = self.lookup_linux_sector {
            report::write_sector_lookup(&mut stdout, &walk.state, sector)?;
        }
        if self.json {
            report::write_json_report(&mut stdout, &walk)?;
        } else {
            report::write_allocation_summary(&mut stdout, &walk)?;

            if self.dump_allocation_map {
                report::write_allocation_map(&mut stdout, &walk, context.verbose)?;
            }
        }
        if progress {
            println!("\nCheck completed.");
        }

        Ok(())
    }
}

#[derive(Parser)]
struct Dump {
    /// Source file or block device.
    source: PathBuf,

    /// Destination file for the metadata dump.
    destination: PathBuf,

    /// Copy only best metadata (highest transaction ID) for descriptor
    /// extraction.
    #[arg(short = 'b', long)]
    best_metadata: bool,

    /// Compact mode: non-sparse file with adjusted offsets.
    #[arg(short = 'c', long)]
    compact: bool,

    /// Force overwrite of the destination if it exists.
    #[arg(short = 'f', long)]
    force: bool,

    /// Include first N encrypted filesystem blocks.
    #[arg(short = 's', long, default_value_t = 0)]
    sample_blocks: u32,
}

impl CliCommand for Dump {
    fn run(&self, context: &CommandContext) -> Result<()> {
        let options = DumpOptions {
            compact: self.compact,
            force: self.force,
            best_metadata_only: self.best_metadata,
            sample_blocks: self.sample_blocks,
        };
        let mut dumper = Dumper::open(&self.source, options, context.abort.clone())?;
        let summary = dumper.dump_to(&self.destination)?;

        println!("\nDump complete.");
        println!("Total bytes copied: {} bytes", summary.bytes_copied);

        if !summary.compact {
            println!("Sparse file size: {} bytes", summary.destination_size);
        }

        Ok(())
    }
}

#[derive(Parser)]
struct Dmsetup {
    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(flatten)]
    volume: VolumeArgs,

    /// Target kernel keyring: @s, @u, @us or a numeric ID.
    #[arg(short = 'K', long, default_value = "@s")]
    keyring: String,

    /// Base name for device mapper devices.
    #[arg(short = 'm', long)]
    mapper_name: Option<String>,

    /// Dry-run mode: print tables without modifying the keyring.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Output complete shell commands instead of raw table lines.
    #[arg(short = 's', long)]
    shell: bool,

    /// Unattended mode, disables user interaction.
    #[arg(short = 'u', long)]
    unattended: bool,
}

impl CliCommand for Dmsetup {
    fn run(&self, context: &CommandContext) -> Result<()> {
        let keyring_target: KeyringTarget = self.keyring.parse()?;
        let credentials = self.credentials.credentials()?;
        let volume_offset = self.volume.volume_offset()?;

        if self.unattended {
            debug!("unattended mode: interactive credential prompts disabled");
        }
        let mut source = self.volume.open_primary()?;

        let unlocker = unlock_backend().ok_or(fvde_core::Error::NoUnlockBackend)?;
        let group = unlocker.unlock(&mut source, &credentials)?;

        let source_path = self.volume.sources[0].display().to_string();
        let mut stdout = io::stdout().lock();

        for (index, volume) in group.logical_volumes.iter().enumerate() {
            context.abort.check()?;

            let keys = volume.keys()?;

            debug!(
                "logical volume {}: {} ({} bytes)",
                index + 1,
                fvde_core::format_identifier(&volume.identifier),
                volume.size
            );

            if self.dry_run {
                debug!("dry run: skipping kernel keyring insertion");
            } else {
                let serial = add_logon_key(keys, &volume.identifier, keyring_target)?;
                debug!("added keyring entry with serial {serial}");
            }
            let entry = TableEntry {
                volume_identifier: &volume.identifier,
                volume_size: volume.size,
                source_path: &source_path,
                volume_offset,
            };
            let name = mapper_name(self.mapper_name.as_deref(), volume.name.as_deref());

            write_table_entry(&mut stdout, &entry, self.shell, name, index + 1)?;
        }

        Ok(())
    }
}

#[derive(Subcommand)]
enum Subcommands {
    /// Validate FVDE metadata by tracking extent allocations.
    Check(Check),
    /// Extract FVDE metadata into a sparse or compact image.
    Dump(Dump),
    /// Emit device-mapper crypt tables backed by the kernel keyring.
    Dmsetup(Dmsetup),
}

impl Subcommands {
    fn as_cli_command(&self) -> &dyn CliCommand {
        match self {
            Self::Check(command) => command,
            Self::Dump(command) => command,
            Self::Dmsetup(command) => command,
        }
    }
}

#[derive(Parser)]
#[command(name = "fvde", version, about = "Forensic tooling for FileVault Drive Encryption volumes")]
struct Cli {
    /// Increase logging verbosity. Can be specified multiple times.
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Subcommands,
}

impl Cli {
    fn run() -> Result<()> {
        let cli = Self::parse();

        let log_level = match cli.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(log_level.as_str()),
        );
        builder.init();

        let abort = AbortFlag::new();
        let handler_flag = abort.clone();

        ctrlc::set_handler(move || {
            handler_flag.signal();

            // Unblock any read stuck on a credential prompt.
            #[cfg(unix)]
            unsafe {
                libc::close(0);
            }
        })?;

        let context = CommandContext {
            abort,
            verbose: cli.verbose > 0,
        };

        cli.command.as_cli_command().run(&context)
    }
}

fn main() {
    let exit_code = match Cli::run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };

    std::process::exit(exit_code)
}
