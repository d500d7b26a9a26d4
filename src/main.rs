//! CLI entry point. Parses the flags described in section 6, builds a
//! `session::SessionConfig`, and hands off to `session::run`. The donor's
//! `main()` built `Args`, span daemons, and ran the dashboard/filters all
//! inline; this keeps the donor's `#[tokio::main] async fn main() ->
//! anyhow::Result<()>` idiom but delegates everything else to `session`.

use anyhow::Result;
use clap::Parser;
use motion_tracker::persistence::DEFAULT_SAVE_INTERVAL_S;
use motion_tracker::session::{self, SessionConfig};
use motion_tracker::types::FilterKind;

/// Which estimator(s) to run. `All` is not a `FilterKind` variant itself
/// (that enum is the tagged-dispatch type workers match on); it expands
/// to every `FilterKind` here, at the CLI boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "kebab-case")]
enum FilterArg {
    Complementary,
    Ekf,
    EsEkf,
    All,
}

impl FilterArg {
    fn expand(self) -> Vec<FilterKind> {
        match self {
            FilterArg::Complementary => vec![FilterKind::Complementary],
            FilterArg::Ekf => vec![FilterKind::Ekf],
            FilterArg::EsEkf => vec![FilterKind::EsEkf],
            FilterArg::All => vec![FilterKind::Complementary, FilterKind::Ekf, FilterKind::EsEkf],
        }
    }
}

/// Section 6's CLI surface: a positional run duration plus the listed
/// flags. `minutes = 0` means run until interrupted, matching the
/// donor's own `duration` positional default.
#[derive(Parser, Debug)]
#[command(name = "motion-tracker", about = "Sensor-fusion and incident-logging recorder")]
struct Args {
    /// How long to record, in minutes. 0 runs until interrupted (Ctrl-C).
    #[arg(default_value_t = 0)]
    minutes: u64,

    /// Which fusion estimator(s) to run.
    #[arg(long, value_enum, default_value_t = FilterArg::All)]
    filter: FilterArg,

    /// Consume the gyroscope stream (bias pseudo-measurements for the
    /// EKF/ES-EKF, rotation-triggered recalibration, swerve detection).
    #[arg(long, default_value_t = true)]
    enable_gyro: bool,

    /// Target sensor sampling interval in milliseconds, passed through to
    /// the IMU daemon's own `-d` argument.
    #[arg(long, default_value_t = 20)]
    rate_ms: u64,

    /// Auto-save interval in seconds.
    #[arg(long, default_value_t = DEFAULT_SAVE_INTERVAL_S)]
    save_interval: u64,

    /// Output directory; each run creates its own `session_<timestamp>`
    /// subdirectory beneath it.
    #[arg(long, default_value = "./sessions")]
    out: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut imu_args = vec!["-s".to_string(), "accelerometer gyroscope".to_string(), "-d".to_string(), args.rate_ms.to_string()];
    if !args.enable_gyro {
        imu_args[1] = "accelerometer".to_string();
    }

    let config = SessionConfig {
        filters: args.filter.expand(),
        enable_gyro: args.enable_gyro,
        rate_ms: args.rate_ms,
        save_interval_s: args.save_interval,
        out_dir: args.out,
        imu_args,
        ..SessionConfig::default()
    };

    match session::run(config, args.minutes).await {
        Ok(stats) => {
            println!(
                "[SESSION] done: accel={} gyro={} gps={} incidents(hard_brake={}, impact={}, swerve={})",
                stats.accel_samples,
                stats.gyro_samples,
                stats.gps_samples,
                stats.hard_brake_incidents,
                stats.impact_incidents,
                stats.swerve_incidents,
            );
            if stats.abnormal_shutdown {
                eprintln!("[SESSION] one or more components did not shut down cleanly within the join timeout");
                std::process::exit(2);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("[SESSION] fatal init failure: {e:#}");
            std::process::exit(1);
        }
    }
}
