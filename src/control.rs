//! Operator control sessions.
//!
//! Inbound messages are JSON objects with an `action` field; replies are
//! JSON ack/echo objects. Every drive command passes through the safety
//! arbitration against the latest sensor snapshot before it reaches the
//! driver, independent of whatever the UI already enforces.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::oi::{commands, OiMode, RoombaDriver, SensorSnapshot};
use serde::Deserialize;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Raw inbound payload; action-specific fields are all optional here and
/// validated per action.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    action: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    velocity: Option<i32>,
    #[serde(default)]
    radius: Option<i32>,
}

/// A validated operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Ping,
    Init,
    Mode(OiMode),
    Drive { velocity: i32, radius: i32 },
    Stop,
    Clean,
    Dock,
}

/// Decode one control message.
pub fn parse_control_message(text: &str) -> Result<ControlAction> {
    let message: ControlMessage = serde_json::from_str(text)
        .map_err(|e| Error::OperatorInvalid(format!("malformed payload: {}", e)))?;
    match message.action.as_str() {
        "ping" => Ok(ControlAction::Ping),
        "init" => Ok(ControlAction::Init),
        "mode" => match message.value.as_deref() {
            Some("safe") => Ok(ControlAction::Mode(OiMode::Safe)),
            Some("full") => Ok(ControlAction::Mode(OiMode::Full)),
            other => Err(Error::OperatorInvalid(format!(
                "mode expects value \"safe\" or \"full\", got {:?}",
                other
            ))),
        },
        "drive" => {
            let velocity = message
                .velocity
                .ok_or_else(|| Error::OperatorInvalid("drive requires velocity".into()))?;
            let radius = message.radius.unwrap_or(commands::RADIUS_STRAIGHT);
            Ok(ControlAction::Drive { velocity, radius })
        }
        "stop" => Ok(ControlAction::Stop),
        "clean" => Ok(ControlAction::Clean),
        "dock" => Ok(ControlAction::Dock),
        other => Err(Error::OperatorInvalid(format!(
            "unsupported action `{}`",
            other
        ))),
    }
}

/// Outcome of the safety check on one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arbitration {
    pub action: ControlAction,
    /// Set when the command was rewritten, with the guard that fired.
    pub guard: Option<&'static str>,
}

fn is_right_turn(radius: i32) -> bool {
    radius < 0
}

fn is_left_turn(radius: i32) -> bool {
    radius > 0 && radius != commands::RADIUS_STRAIGHT
}

/// Rewrite unsafe drive commands to `stop` based on the bumper, wheel-drop
/// and cliff state.
///
/// - both bumpers: only reverse passes;
/// - left bumper: reverse or a right turn passes;
/// - right bumper: reverse or a left turn passes;
/// - any wheel drop or cliff: nothing passes until the condition clears.
pub fn arbitrate(action: ControlAction, snapshot: &SensorSnapshot) -> Arbitration {
    let ControlAction::Drive { velocity, radius } = action else {
        return Arbitration {
            action,
            guard: None,
        };
    };

    if snapshot.any_hazard() {
        return Arbitration {
            action: ControlAction::Stop,
            guard: Some("hazard_active"),
        };
    }

    let reverse = velocity < 0;
    let guard = match (snapshot.bump_left, snapshot.bump_right) {
        (true, true) if !reverse => Some("bumpers_pressed"),
        (true, false) if !(reverse || is_right_turn(radius)) => Some("left_bumper"),
        (false, true) if !(reverse || is_left_turn(radius)) => Some("right_bumper"),
        _ => None,
    };

    match guard {
        Some(guard) => Arbitration {
            action: ControlAction::Stop,
            guard: Some(guard),
        },
        None => Arbitration {
            action,
            guard: None,
        },
    }
}

/// Execute one parsed command against the driver and build the reply.
///
/// Driver `Closed` propagates; everything else is folded into the reply so
/// the channel stays open.
pub fn handle_control_message(
    text: &str,
    driver: &RoombaDriver,
    config: &Config,
) -> Result<serde_json::Value> {
    let action = match parse_control_message(text) {
        Ok(action) => action,
        Err(Error::OperatorInvalid(reason)) => {
            return Ok(json!({"ok": false, "error": reason}));
        }
        Err(e) => return Err(e),
    };

    let arbitration = arbitrate(action, &driver.latest_snapshot());
    let outcome = execute(arbitration.action, driver, config);
    match outcome {
        Ok(mut reply) => {
            if let Some(guard) = arbitration.guard {
                reply["guard"] = json!(guard);
                reply["rewritten"] = json!(true);
            }
            Ok(reply)
        }
        Err(Error::Closed) => Err(Error::Closed),
        Err(e) => Ok(json!({"ok": false, "error": e.to_string()})),
    }
}

fn execute(
    action: ControlAction,
    driver: &RoombaDriver,
    config: &Config,
) -> Result<serde_json::Value> {
    match action {
        ControlAction::Ping => Ok(json!({"ok": true, "action": "ping"})),
        ControlAction::Init => {
            driver.connect()?;
            driver.start()?;
            driver.mode(OiMode::Safe)?;
            driver.ensure_sensor_stream(config.roomba_stream_group, config.roomba_stream_hz)?;
            Ok(json!({"ok": true, "action": "init", "connected": true}))
        }
        ControlAction::Mode(mode) => {
            driver.mode(mode)?;
            Ok(json!({"ok": true, "action": "mode", "value": mode.as_str()}))
        }
        ControlAction::Drive { velocity, radius } => {
            let sent = driver.drive(velocity, radius)?;
            Ok(json!({
                "ok": true,
                "action": "drive",
                "velocity": sent.velocity_mm_s,
                "radius": sent.radius_mm,
            }))
        }
        ControlAction::Stop => {
            driver.stop()?;
            Ok(json!({"ok": true, "action": "stop"}))
        }
        ControlAction::Clean => {
            driver.clean()?;
            Ok(json!({"ok": true, "action": "clean"}))
        }
        ControlAction::Dock => {
            driver.dock()?;
            Ok(json!({"ok": true, "action": "dock"}))
        }
    }
}

/// Accept loop for operator TCP sessions (one thread per connection,
/// newline-delimited JSON both ways).
pub fn spawn_control_server(
    config: Arc<Config>,
    driver: Arc<RoombaDriver>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(&config.control_bind_address).map_err(|e| {
        Error::Other(format!(
            "Failed to bind control listener {}: {}",
            config.control_bind_address, e
        ))
    })?;
    listener.set_nonblocking(true)?;
    log::info!("Control listener on {}", config.control_bind_address);

    let handle = thread::Builder::new()
        .name("control-listener".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        log::info!("Operator connected: {}", addr);
                        let driver = Arc::clone(&driver);
                        let config = Arc::clone(&config);
                        let shutdown = Arc::clone(&shutdown);
                        let spawned = thread::Builder::new()
                            .name("control-session".to_string())
                            .spawn(move || {
                                if let Err(e) = session_loop(stream, &driver, &config, &shutdown) {
                                    log::warn!("Control session closed: {}", e);
                                }
                            });
                        if let Err(e) = spawned {
                            log::error!("Failed to spawn control session: {}", e);
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(100));
                    }
                    Err(e) => log::error!("Control accept error: {}", e),
                }
            }
            log::info!("Control listener exiting");
        })
        .map_err(|e| Error::Other(format!("Failed to spawn control listener: {}", e)))?;
    Ok(handle)
}

fn session_loop(
    stream: TcpStream,
    driver: &RoombaDriver,
    config: &Config,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break, // peer went away
        };
        if line.trim().is_empty() {
            continue;
        }

        match handle_control_message(&line, driver, config) {
            Ok(reply) => {
                writeln!(writer, "{}", reply)?;
            }
            Err(e) => {
                // Terminal driver failure: tell the operator and close.
                let reason = json!({"ok": false, "fatal": true, "error": e.to_string()});
                let _ = writeln!(writer, "{}", reason);
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BenchLink, Transport};

    fn bench_driver() -> (Arc<RoombaDriver>, BenchLink) {
        let bench = BenchLink::new();
        let factory_bench = bench.clone();
        let factory = Arc::new(move || -> Result<Box<dyn Transport>> {
            Ok(Box::new(factory_bench.clone()) as Box<dyn Transport>)
        });
        (
            Arc::new(RoombaDriver::new(factory, Duration::from_secs(1))),
            bench,
        )
    }

    fn bump(left: bool, right: bool) -> SensorSnapshot {
        SensorSnapshot {
            bump_left: left,
            bump_right: right,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(parse_control_message(r#"{"action":"ping"}"#).unwrap(), ControlAction::Ping);
        assert_eq!(
            parse_control_message(r#"{"action":"mode","value":"full"}"#).unwrap(),
            ControlAction::Mode(OiMode::Full)
        );
        assert_eq!(
            parse_control_message(r#"{"action":"drive","velocity":200,"radius":-200}"#).unwrap(),
            ControlAction::Drive {
                velocity: 200,
                radius: -200
            }
        );
    }

    #[test]
    fn test_unknown_action_is_operator_invalid() {
        assert!(matches!(
            parse_control_message(r#"{"action":"fly"}"#),
            Err(Error::OperatorInvalid(_))
        ));
        assert!(matches!(
            parse_control_message("not json"),
            Err(Error::OperatorInvalid(_))
        ));
    }

    #[test]
    fn test_both_bumpers_allow_only_reverse() {
        let snapshot = bump(true, true);
        let forward = arbitrate(
            ControlAction::Drive {
                velocity: 200,
                radius: commands::RADIUS_STRAIGHT,
            },
            &snapshot,
        );
        assert_eq!(forward.action, ControlAction::Stop);
        assert_eq!(forward.guard, Some("bumpers_pressed"));

        let reverse = arbitrate(
            ControlAction::Drive {
                velocity: -200,
                radius: commands::RADIUS_STRAIGHT,
            },
            &snapshot,
        );
        assert!(reverse.guard.is_none());
    }

    #[test]
    fn test_left_bumper_allows_right_turn() {
        let snapshot = bump(true, false);
        let right_turn = arbitrate(
            ControlAction::Drive {
                velocity: 200,
                radius: -200,
            },
            &snapshot,
        );
        assert!(right_turn.guard.is_none());

        let forward = arbitrate(
            ControlAction::Drive {
                velocity: 200,
                radius: commands::RADIUS_STRAIGHT,
            },
            &snapshot,
        );
        assert_eq!(forward.action, ControlAction::Stop);
        assert_eq!(forward.guard, Some("left_bumper"));
    }

    #[test]
    fn test_right_bumper_straight_is_not_a_left_turn() {
        let snapshot = bump(false, true);
        // Radius 32768 means straight ahead; it must not pass as a turn.
        let straight = arbitrate(
            ControlAction::Drive {
                velocity: 200,
                radius: commands::RADIUS_STRAIGHT,
            },
            &snapshot,
        );
        assert_eq!(straight.action, ControlAction::Stop);

        let spin_left = arbitrate(
            ControlAction::Drive {
                velocity: 200,
                radius: commands::RADIUS_SPIN_CCW,
            },
            &snapshot,
        );
        assert!(spin_left.guard.is_none());
    }

    #[test]
    fn test_hazard_rewrites_everything() {
        let mut snapshot = SensorSnapshot::default();
        snapshot.cliff_front_left = true;
        let result = arbitrate(
            ControlAction::Drive {
                velocity: -100,
                radius: commands::RADIUS_STRAIGHT,
            },
            &snapshot,
        );
        assert_eq!(result.action, ControlAction::Stop);
        assert_eq!(result.guard, Some("hazard_active"));
    }

    #[test]
    fn test_guarded_drive_sends_stop_to_wire() {
        let (driver, bench) = bench_driver();
        let config = Config::default();
        // No bumpers: drive goes through.
        let reply = handle_control_message(
            r#"{"action":"drive","velocity":900,"radius":32768}"#,
            &driver,
            &config,
        )
        .unwrap();
        assert_eq!(reply["ok"], json!(true));
        assert_eq!(reply["velocity"], json!(500)); // clamped echo
        let written = bench.sent();
        assert_eq!(written.len(), 5);
        assert_eq!(written[0], commands::CMD_DRIVE);
    }

    #[test]
    fn test_bad_payload_keeps_channel_usable() {
        let (driver, _bench) = bench_driver();
        let config = Config::default();
        let reply = handle_control_message(r#"{"action":"warp"}"#, &driver, &config).unwrap();
        assert_eq!(reply["ok"], json!(false));
        assert!(reply["error"].as_str().unwrap().contains("unsupported"));
    }

    #[test]
    fn test_closed_driver_is_fatal_for_session() {
        let (driver, _bench) = bench_driver();
        driver.close();
        let config = Config::default();
        let result =
            handle_control_message(r#"{"action":"stop"}"#, &driver, &config);
        assert!(matches!(result, Err(Error::Closed)));
    }
}
