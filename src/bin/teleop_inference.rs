//! Teleop inference node - tracks a planned trajectory on a simulated arm,
//! infers the operator's goal from corrections and replans.
//!
//! Usage:
//!   teleop-inference --config <file> [options]
//!
//! Stops on Ctrl+C, ENTER, or after `--duration` seconds, then writes the run
//! recording into the configured save directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use teleop_inference::joint::DEG_TO_RAD;
use teleop_inference::{
    DeviceFeed, JointVector, SensorFeed, SimConfig, SimulatedArm, TeleopConfig, TeleopNode,
};

#[derive(Parser, Debug)]
#[command(
    name = "teleop-inference",
    version,
    about = "Compliant trajectory tracking with goal inference"
)]
struct Args {
    /// Node configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Stop after this many seconds (default: until Ctrl+C or ENTER)
    #[arg(long, value_parser = seconds)]
    duration: Option<f64>,

    /// Override setup.save_dir
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Simulated sensor noise (deg)
    #[arg(long, default_value_t = 0.0)]
    noise: f64,

    /// Push the simulated arm at this time (s)
    #[arg(long, value_parser = seconds)]
    push_at: Option<f64>,

    /// Joint to push
    #[arg(long, default_value_t = 0)]
    push_joint: usize,

    /// Push size (deg)
    #[arg(long, default_value_t = 5.0, allow_hyphen_values = true)]
    push_deg: f64,
}

/// A finite, non-negative number of seconds.
fn seconds(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if secs.is_finite() && secs >= 0.0 {
        Ok(secs)
    } else {
        Err(format!("expected a non-negative number of seconds, got {}", s))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("teleop_inference=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = TeleopConfig::load(&args.config)?;
    if let Some(dir) = args.log_dir.clone() {
        config.setup.save_dir = dir;
    }

    let cancel = CancellationToken::new();

    // Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
    });

    // ENTER on stdin; a plain thread so a pending read never holds up shutdown
    let cancel_clone = cancel.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() {
            tracing::info!("ENTER received, stopping...");
            cancel_clone.cancel();
        }
    });

    // Duration timer
    if let Some(secs) = args.duration {
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            tracing::info!("Duration reached ({}s), stopping...", secs);
            cancel_clone.cancel();
        });
    }

    let (sensor, _) = SensorFeed::channel();
    let (device, _) = DeviceFeed::channel();
    let (arm, handle) = SimulatedArm::new(
        config.start(),
        sensor.clone(),
        SimConfig {
            dt: 1.0 / config.rate_hz,
            noise_deg: args.noise,
            ..Default::default()
        },
    );

    let planner = config.build_planner()?;
    let (node, handles) = TeleopNode::new(&config, planner, arm, &sensor, &device)?;

    if let Some(at) = args.push_at {
        let dof = config.dof();
        if args.push_joint >= dof {
            anyhow::bail!("--push-joint {} out of range for {} joints", args.push_joint, dof);
        }
        let mut delta = JointVector::zeros(dof);
        delta[args.push_joint] = args.push_deg * DEG_TO_RAD;
        let handle = handle.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs_f64(at)) => {
                    if handle.push(delta) {
                        tracing::info!("Pushed simulated arm at t={:.2}s", at);
                    }
                }
            }
        });
    }

    println!();
    println!("========================================");
    println!("Teleop Inference");
    println!("========================================");
    println!("Prefix:     {}", config.setup.prefix);
    println!("Joints:     {}", config.dof());
    println!("Goals:      {}", config.setup.goals.len());
    println!("Horizon:    {}s (timestep {}s)", config.setup.horizon, config.setup.timestep);
    println!("Rate:       {} Hz", config.rate_hz);
    println!("Detection:  {:?}", config.detector.mode);
    println!("Save dir:   {}", config.setup.save_dir.display());
    if let Some(d) = args.duration {
        println!("Duration:   {}s", d);
    } else {
        println!("Duration:   until Ctrl+C or ENTER");
    }
    println!("========================================");
    println!();

    let summary = node.run(cancel).await?;

    println!();
    println!("Cycles:       {}", summary.stats.cycles);
    println!("Overruns:     {}", summary.stats.overruns);
    println!("Corrections:  {}", summary.stats.corrections);
    println!(
        "Replans:      {} installed, {} discarded, {} failed",
        summary.replans.installed, summary.replans.discarded, summary.replans.failures
    );
    println!("Progress:     {}", summary.progress);
    println!("Belief:       {:?}", summary.belief);
    println!("Final pos:    {:?}", teleop_inference::joint::to_degrees(&handle.position()));
    println!("Commands:     {}", handle.commands_published());
    if let Some(path) = summary.recording {
        println!("Recording:    {}", path.display());
    }
    println!(
        "Plan:         generation {}",
        handles.plans.borrow().generation
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_rejects_negative_and_nan() {
        assert_eq!(seconds("2.5"), Ok(2.5));
        assert_eq!(seconds("0"), Ok(0.0));
        assert!(seconds("-1").is_err());
        assert!(seconds("NaN").is_err());
        assert!(seconds("inf").is_err());
        assert!(seconds("soon").is_err());
    }

    #[test]
    fn test_args_reject_negative_duration() {
        assert!(Args::try_parse_from(["teleop-inference", "--config", "c.json", "--duration", "-3"])
            .is_err());
        let args =
            Args::try_parse_from(["teleop-inference", "--config", "c.json", "--push-at", "1.5"])
                .unwrap();
        assert_eq!(args.push_at, Some(1.5));
    }
}
