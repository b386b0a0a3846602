// vim: tw=80
//! Command line zone management for ZBC/ZAC devices.

use std::{path::{Path, PathBuf}, sync::Arc};

use clap::{crate_version, Parser};
use shingle_core::{
    codec::{ReportOption, ZoneAction},
    device::ZonedDevice,
    sg::SgTransport,
    types::{LbaT, Result, ZonedModel},
    zone::{ZoneCondition, ZoneType},
};
use tracing_subscriber::EnvFilter;

fn open(device: &Path, ata: bool) -> Result<Arc<ZonedDevice>> {
    let transport = Arc::new(SgTransport::open(device)?);
    Ok(ZonedDevice::new(transport, ata, ZonedModel::NotZoned))
}

fn parse_report_opt(s: &str) -> std::result::Result<ReportOption, String> {
    match s {
        "all" => Ok(ReportOption::All),
        "empty" => Ok(ReportOption::Empty),
        "imp-open" => Ok(ReportOption::ImplicitOpen),
        "exp-open" => Ok(ReportOption::ExplicitOpen),
        "closed" => Ok(ReportOption::Closed),
        "full" => Ok(ReportOption::Full),
        "read-only" => Ok(ReportOption::ReadOnly),
        "offline" => Ok(ReportOption::Offline),
        "need-reset" => Ok(ReportOption::NeedReset),
        "non-seq" => Ok(ReportOption::NonSeq),
        "non-wp" => Ok(ReportOption::NonWp),
        _ => Err(format!("unknown reporting option {s:?}")),
    }
}

fn type_name(t: ZoneType) -> &'static str {
    match t {
        ZoneType::Conventional => "conv",
        ZoneType::SeqWriteRequired => "swr",
        ZoneType::SeqWritePreferred => "swp",
    }
}

fn cond_name(c: ZoneCondition) -> &'static str {
    match c {
        ZoneCondition::NoWp => "no-wp",
        ZoneCondition::Empty => "empty",
        ZoneCondition::ImplicitOpen => "imp-open",
        ZoneCondition::ExplicitOpen => "exp-open",
        ZoneCondition::Closed => "closed",
        ZoneCondition::ReadOnly => "read-only",
        ZoneCondition::Full => "full",
        ZoneCondition::Offline => "offline",
    }
}

#[derive(Parser, Clone, Debug)]
/// List a device's zones
struct Report {
    /// Speak ATA ZAC through pass-through instead of SCSI ZBC
    #[clap(long)]
    ata:    bool,
    /// Only report zones in this condition: all, empty, imp-open, exp-open,
    /// closed, full, read-only, offline, need-reset, non-seq, non-wp
    #[clap(short = 'o', long, default_value = "all",
           value_parser = parse_report_opt)]
    option: ReportOption,
    /// Device node
    device: PathBuf,
    /// Report zones from this LBA onward
    #[clap(default_value_t = 0)]
    lba:    LbaT,
}

impl Report {
    async fn main(self) -> Result<()> {
        let dev = open(&self.device, self.ata)?;
        let (hdr, zones) = dev.report_zones(self.lba, self.option).await?;
        println!("{} zones, max lba {:#x}", hdr.nr_zones(), hdr.max_lba);
        let mut table = tabular::Table::new("{:>}  {:>}  {:<}  {:<}  {:>}  {:<}");
        table.add_row(
            tabular::Row::new()
                .with_cell("START")
                .with_cell("LENGTH")
                .with_cell("TYPE")
                .with_cell("COND")
                .with_cell("WP")
                .with_cell("FLAGS"),
        );
        for z in &zones {
            let mut flags = String::new();
            if z.reset {
                flags.push('R');
            }
            if z.non_seq {
                flags.push('N');
            }
            table.add_row(
                tabular::Row::new()
                    .with_cell(format!("{:#x}", z.start))
                    .with_cell(format!("{:#x}", z.length))
                    .with_cell(type_name(z.zone_type))
                    .with_cell(cond_name(z.condition))
                    .with_cell(if z.zone_type == ZoneType::Conventional {
                        "-".to_owned()
                    } else {
                        format!("{:#x}", z.wp)
                    })
                    .with_cell(flags),
            );
        }
        print!("{table}");
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
struct ActionArgs {
    /// Speak ATA ZAC through pass-through instead of SCSI ZBC
    #[clap(long)]
    ata:    bool,
    /// Apply to every zone on the device
    #[clap(long, conflicts_with = "lba")]
    all:    bool,
    /// Device node
    device: PathBuf,
    /// LBA anywhere within the target zone
    #[clap(default_value_t = 0)]
    lba:    LbaT,
}

impl ActionArgs {
    async fn main(self, action: ZoneAction) -> Result<()> {
        let dev = open(&self.device, self.ata)?;
        dev.zone_action(action, self.lba, self.all).await?;
        // Let the post-action zone refresh finish before exiting.
        dev.quiesce().await;
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Report what kind of zoned device this is
struct Identify {
    /// Speak ATA ZAC through pass-through instead of SCSI ZBC
    #[clap(long)]
    ata:    bool,
    /// Device node
    device: PathBuf,
}

impl Identify {
    async fn main(self) -> Result<()> {
        let dev = open(&self.device, self.ata)?;
        let model = dev.identify().await?;
        let name = match model {
            ZonedModel::NotZoned => "not zoned",
            ZonedModel::HostAware => "host-aware",
            ZonedModel::HostManaged => "host-managed",
        };
        println!("{}: {}", self.device.display(), name);
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    /// Close an open zone
    CloseZone(ActionArgs),
    /// Move a zone's write pointer to its end, making it Full
    FinishZone(ActionArgs),
    Identify(Identify),
    /// Explicitly open a zone
    OpenZone(ActionArgs),
    Report(Report),
    /// Reset a zone's write pointer, discarding its contents
    ResetWp(ActionArgs),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::CloseZone(args) => args.main(ZoneAction::Close).await,
        SubCommand::FinishZone(args) => args.main(ZoneAction::Finish).await,
        SubCommand::Identify(identify) => identify.main().await,
        SubCommand::OpenZone(args) => args.main(ZoneAction::Open).await,
        SubCommand::Report(report) => report.main().await,
        SubCommand::ResetWp(args) => args.main(ZoneAction::ResetWp).await,
    }
}
