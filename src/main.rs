use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use flowpilot::config::Config;
use flowpilot::control::{AltitudeController, PositionController};
use flowpilot::flight::FlightSequencer;
use flowpilot::link::{FlightMode, VehicleLink};
use flowpilot::video::{FrameDistributor, FrameSource};
use flowpilot::vision::OpticalFlowEngine;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "flowpilot.toml".to_string());
    let config = Config::load(&config_path)?;

    let link = Arc::new(VehicleLink::new(config.link.clone()));
    link.connect().context("failed to connect to vehicle")?;

    let distributor = Arc::new(FrameDistributor::new(config.video.tap_capacity));
    let overlay = distributor.overlay();
    let engine = Arc::new(OpticalFlowEngine::new(
        config.flow.clone(),
        Arc::clone(&overlay),
        Some(Arc::clone(&link)),
    ));
    engine.attach(&distributor);

    let altitude = Arc::new(Mutex::new(AltitudeController::new(
        config.altitude.clone(),
        Arc::clone(&link),
    )));
    let position = Arc::new(Mutex::new(PositionController::new(
        config.position.clone(),
        Arc::clone(&link),
    )));

    let sequencer = Arc::new(FlightSequencer::new(
        config.clone(),
        Arc::clone(&link),
        Arc::clone(&engine),
        altitude,
        position,
        overlay,
    ));
    sequencer.register_observers();
    sequencer.spawn_watchdog();

    println!("\n=== flowpilot control interface ===");
    println!("Connected to vehicle. Type 'help' for commands.");

    let stdin = io::stdin();
    loop {
        print!("\n> ");
        io::stdout().flush()?;
        let Some(line) = stdin.lock().lines().next() else {
            break;
        };
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };
        let arg = parts.next();

        match command.to_ascii_lowercase().as_str() {
            "check" => {
                let (passed, failures) = link.run_prearm_diagnostics();
                if passed {
                    println!("All pre-arm checks passed");
                } else {
                    println!("Pre-arm failures:");
                    for failure in failures {
                        println!("  - {failure}");
                    }
                }
            }
            "mode" => match arg.and_then(|m| m.parse::<FlightMode>().ok()) {
                Some(mode) => {
                    if link.set_mode(mode, link.config().confirm_timeout()) {
                        println!("Flight mode set to {mode}");
                    } else {
                        println!("Failed to set flight mode");
                    }
                }
                None => {
                    println!("Usage: mode <name>. Available modes:");
                    for mode in FlightMode::ALL {
                        println!("  {mode}");
                    }
                }
            },
            "arm" => {
                if link.arm(link.config().confirm_timeout()) {
                    println!("Armed");
                } else {
                    println!("Arming failed");
                }
            }
            "disarm" => {
                if link.disarm(link.config().confirm_timeout()) {
                    println!("Disarmed");
                } else {
                    println!("Disarming failed");
                }
            }
            "takeoff" => {
                let target = arg.and_then(|a| a.parse::<f64>().ok()).unwrap_or(1.0);
                if let Err(e) = ensure_video(&config, &distributor) {
                    println!("Video unavailable: {e:#}");
                    continue;
                }
                if sequencer.takeoff(target) {
                    println!("Takeoff complete, holding at {target:.1} m");
                } else {
                    println!("Takeoff failed");
                }
            }
            "land" => {
                if sequencer.land() {
                    println!("Landed");
                } else {
                    println!("Landing failed");
                }
            }
            "rotate" => match arg.and_then(|a| a.parse::<f64>().ok()) {
                Some(degrees) => {
                    if sequencer.rotate(degrees) {
                        println!("Rotated {degrees:.0} degrees");
                    } else {
                        println!("Rotation failed");
                    }
                }
                None => println!("Usage: rotate <degrees> (positive = right)"),
            },
            "forward" => match arg.and_then(|a| a.parse::<f64>().ok()) {
                Some(meters) => {
                    let report = sequencer.translate(meters, 0.5);
                    if report.success {
                        println!(
                            "Moved {:.2} m (timed estimate {:.2} m, discrepancy {:.2} m)",
                            report.measured_m, report.time_estimated_m, report.error_m
                        );
                    } else {
                        println!("Movement failed");
                    }
                }
                None => println!("Usage: forward <meters>"),
            },
            "hold" => {
                if let Err(e) = ensure_video(&config, &distributor) {
                    println!("Video unavailable: {e:#}");
                    continue;
                }
                sequencer.hold();
                println!("Position hold active");
            }
            "release" => {
                if sequencer.release() {
                    println!("Position hold deactivated");
                } else {
                    println!("Position hold was not active");
                }
            }
            "status" => {
                let altitude = link
                    .altitude(Duration::from_secs(1))
                    .map(|a| format!("{a:.2} m"))
                    .unwrap_or_else(|| "unavailable".to_string());
                let mode = link
                    .current_mode()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!("Altitude:    {altitude}");
                println!("Armed:       {}", link.is_armed());
                println!("Flight mode: {mode}");
                println!("Link:        {:?}", link.link_state());
            }
            "video" => {
                if let Err(e) = ensure_video(&config, &distributor) {
                    println!("Video unavailable: {e:#}");
                    continue;
                }
                distributor.set_display(true);
                println!("Video feed started (press 'q' in the window to close)");
            }
            "stopvideo" => {
                distributor.set_display(false);
                println!("Video feed stopped");
            }
            "help" => print_commands(),
            "exit" => {
                if link.is_armed() {
                    println!("Landing before exit...");
                    sequencer.land();
                }
                break;
            }
            other => println!("Unknown command '{other}'. Type 'help' for commands."),
        }
    }

    // Land on any exit path, not just the exit command.
    if link.is_armed() {
        println!("Landing before shutdown...");
        sequencer.land();
    }

    println!("Shutting down");
    sequencer.shutdown();
    distributor.stop();
    link.disconnect();
    Ok(())
}

/// Open the camera and start the capture thread on first use.
fn ensure_video(config: &Config, distributor: &Arc<FrameDistributor>) -> Result<()> {
    if distributor.is_running() {
        return Ok(());
    }
    let source = FrameSource::open(
        config.video.device_index,
        config.video.frame_width,
        config.video.frame_height,
    )?;
    distributor.start(source);
    Ok(())
}

fn print_commands() {
    println!("Available commands:");
    println!("  check          - Run pre-arm checks");
    println!("  mode <name>    - Set flight mode");
    println!("  arm            - Arm the motors");
    println!("  disarm         - Disarm the motors");
    println!("  takeoff [m]    - Take off to the given altitude (default 1.0 m)");
    println!("  land           - Land and disarm");
    println!("  rotate <deg>   - Rotate while maintaining position");
    println!("  forward <m>    - Move forward while maintaining position");
    println!("  hold           - Start position hold");
    println!("  release        - Stop position hold");
    println!("  status         - Print vehicle status");
    println!("  video          - Show the live feed with flow overlay");
    println!("  stopvideo      - Hide the live feed");
    println!("  help           - Show this list");
    println!("  exit           - Land if armed, then quit");
}
