// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context as AnyhowContext;
use anyhow::Result;
use dbus::channel::MatchingReceiver;
use dbus::channel::Sender;
use dbus::message::MatchRule;
use dbus::message::Message;
use dbus::nonblock::SyncConnection;
use dbus_crossroads::Context;
use dbus_crossroads::Crossroads;
use dbus_crossroads::IfaceBuilder;
use dbus_crossroads::IfaceToken;
use dbus_crossroads::MethodErr;
use dbus_tokio::connection;
use log::error;
use log::info;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;

use crate::clock::BootClock;
use crate::config::DirectoryPrefsProvider;
use crate::config::SuspendConfig;
use crate::dark_resume::DarkResumePolicy;
use crate::delegate::SystemDelegate;
use crate::delegate::SHUTDOWN_PROGRAM;
use crate::event_loop::EventLoop;
use crate::event_loop::TokioEventLoop;
use crate::metrics::MetricsLogger;
use crate::metrics::METRICS_CLIENT;
use crate::power_supply::DirectoryPowerSupply;
use crate::shutdown_from_suspend::ShutdownFromSuspendPolicy;
use crate::suspender::DisplayMode;
use crate::suspender::SignalSender;
use crate::suspender::SuspendReason;
use crate::suspender::Suspender;
use crate::syslog::level_from_u8;
use crate::syslog::LevelFilter;
use crate::util::PowerError;

const SERVICE_NAME: &str = "org.chromium.PowerManager";
const PATH_NAME: &str = "/org/chromium/PowerManager";
const INTERFACE_NAME: &str = SERVICE_NAME;

const DBUS_INTERFACE_NAME: &str = "org.freedesktop.DBus";
const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";

const SUSPEND_IMMINENT: &str = "SuspendImminent";
const DARK_SUSPEND_IMMINENT: &str = "DarkSuspendImminent";
const SUSPEND_DONE: &str = "SuspendDone";

/// RequestSuspend's external wakeup count when the caller has none.
const NO_EXTERNAL_WAKEUP_COUNT: u64 = u64::MAX;

type PowerdSuspender = Suspender<
    SystemDelegate,
    DarkResumePolicy<DirectoryPowerSupply>,
    ShutdownFromSuspendPolicy<DirectoryPowerSupply>,
>;

// Context data for the D-Bus service.
#[derive(Clone)]
struct DbusContext {
    suspender: Arc<Mutex<PowerdSuspender>>,
}

impl DbusContext {
    fn lock(&self) -> Result<MutexGuard<PowerdSuspender>, MethodErr> {
        self.suspender.lock().map_err(|e| {
            error!("Suspender lock poisoned: {}", e);
            MethodErr::failed("Suspender unavailable")
        })
    }
}

struct DbusSignalSender {
    conn: Arc<SyncConnection>,
}

impl DbusSignalSender {
    fn send(&self, msg: Message, name: &str) {
        if self.conn.send(msg).is_err() {
            error!("Send {} signal failed.", name);
        }
    }
}

fn new_signal(name: &str) -> Message {
    Message::signal(&PATH_NAME.into(), &INTERFACE_NAME.into(), &name.into())
}

impl SignalSender for DbusSignalSender {
    fn suspend_imminent(&self, suspend_id: i32, reason: SuspendReason) {
        self.send(
            new_signal(SUSPEND_IMMINENT).append2(suspend_id, reason as i32),
            SUSPEND_IMMINENT,
        );
    }

    fn dark_suspend_imminent(&self, suspend_id: i32) {
        self.send(
            new_signal(DARK_SUSPEND_IMMINENT).append1(suspend_id),
            DARK_SUSPEND_IMMINENT,
        );
    }

    fn suspend_done(&self, suspend_id: i32, suspend_duration: Duration) {
        let duration_us = i64::try_from(suspend_duration.as_micros()).unwrap_or(i64::MAX);
        self.send(
            new_signal(SUSPEND_DONE).append2(suspend_id, duration_us),
            SUSPEND_DONE,
        );
    }
}

/// Validates the arguments of RequestSuspend.
fn parse_suspend_request(
    external_wakeup_count: u64,
    wakeup_timeout_sec: i32,
    flavor: u32,
) -> std::result::Result<(Option<u64>, Option<Duration>), PowerError> {
    if flavor != 0 {
        return Err(PowerError::UnsupportedFlavor(flavor));
    }
    let wakeup_count =
        (external_wakeup_count != NO_EXTERNAL_WAKEUP_COUNT).then_some(external_wakeup_count);
    let duration =
        (wakeup_timeout_sec > 0).then(|| Duration::from_secs(wakeup_timeout_sec as u64));
    Ok((wakeup_count, duration))
}

/// Validates the arguments of Register(Dark)SuspendDelay.
fn parse_delay_registration(
    timeout_ms: i64,
    description: &str,
) -> std::result::Result<Duration, PowerError> {
    if timeout_ms < 0 {
        return Err(PowerError::NegativeDelayTimeout(timeout_ms));
    }
    if description.is_empty() {
        return Err(PowerError::EmptyDelayDescription);
    }
    Ok(Duration::from_millis(timeout_ms as u64))
}

fn parse_display_mode(mode: u32) -> std::result::Result<DisplayMode, PowerError> {
    match mode {
        0 => Ok(DisplayMode::Normal),
        1 => Ok(DisplayMode::Presentation),
        _ => Err(PowerError::InvalidDisplayMode(mode)),
    }
}

fn parse_log_level(level: u8) -> std::result::Result<LevelFilter, PowerError> {
    level_from_u8(level).ok_or(PowerError::InvalidLogLevel(level))
}

fn invalid_arg(e: PowerError) -> MethodErr {
    info!("Rejecting D-Bus call: {}", e);
    MethodErr::invalid_arg(&e.to_string())
}

fn sender_name(ctx: &Context) -> Result<String, MethodErr> {
    ctx.message()
        .sender()
        .map(|sender| sender.to_string())
        .ok_or_else(|| MethodErr::failed("Method call has no sender"))
}

fn register_interface(cr: &mut Crossroads) -> IfaceToken<DbusContext> {
    cr.register(INTERFACE_NAME, |b: &mut IfaceBuilder<DbusContext>| {
        b.method(
            "RequestSuspend",
            ("external_wakeup_count", "wakeup_timeout_sec", "flavor"),
            (),
            move |_, context, (external_wakeup_count, wakeup_timeout_sec, flavor): (
                u64,
                i32,
                u32,
            )| {
                let (wakeup_count, duration) =
                    parse_suspend_request(external_wakeup_count, wakeup_timeout_sec, flavor)
                        .map_err(invalid_arg)?;
                let mut suspender = context.lock()?;
                match wakeup_count {
                    Some(count) => suspender.request_suspend_with_external_wakeup_count(
                        SuspendReason::Other,
                        count,
                        duration,
                    ),
                    None => suspender.request_suspend(SuspendReason::Other, duration),
                }
                Ok(())
            },
        );
        b.method(
            "RegisterSuspendDelay",
            ("timeout_ms", "description"),
            ("delay_id",),
            move |ctx, context, (timeout_ms, description): (i64, String)| {
                let timeout =
                    parse_delay_registration(timeout_ms, &description).map_err(invalid_arg)?;
                let owner = sender_name(ctx)?;
                let delay_id =
                    context
                        .lock()?
                        .register_suspend_delay(timeout, &owner, &description);
                Ok((delay_id,))
            },
        );
        b.method(
            "RegisterDarkSuspendDelay",
            ("timeout_ms", "description"),
            ("delay_id",),
            move |ctx, context, (timeout_ms, description): (i64, String)| {
                let timeout =
                    parse_delay_registration(timeout_ms, &description).map_err(invalid_arg)?;
                let owner = sender_name(ctx)?;
                let delay_id =
                    context
                        .lock()?
                        .register_dark_suspend_delay(timeout, &owner, &description);
                Ok((delay_id,))
            },
        );
        b.method(
            "UnregisterSuspendDelay",
            ("delay_id",),
            (),
            move |_, context, (delay_id,): (i32,)| {
                context.lock()?.unregister_suspend_delay(delay_id);
                Ok(())
            },
        );
        b.method(
            "UnregisterDarkSuspendDelay",
            ("delay_id",),
            (),
            move |_, context, (delay_id,): (i32,)| {
                context.lock()?.unregister_dark_suspend_delay(delay_id);
                Ok(())
            },
        );
        b.method(
            "HandleSuspendReadiness",
            ("delay_id", "suspend_id"),
            (),
            move |_, context, (delay_id, suspend_id): (i32, i32)| {
                context
                    .lock()?
                    .handle_suspend_readiness(delay_id, suspend_id);
                Ok(())
            },
        );
        b.method(
            "HandleDarkSuspendReadiness",
            ("delay_id", "suspend_id"),
            (),
            move |_, context, (delay_id, suspend_id): (i32, i32)| {
                context
                    .lock()?
                    .handle_dark_suspend_readiness(delay_id, suspend_id);
                Ok(())
            },
        );
        b.method(
            "RecordDarkResumeWakeReason",
            ("reason",),
            (),
            move |_, context, (reason,): (String,)| {
                context.lock()?.record_dark_resume_wake_reason(&reason);
                Ok(())
            },
        );
        b.method("HandleUserActivity", (), (), move |_, context, ()| {
            context.lock()?.handle_user_activity();
            Ok(())
        });
        b.method("HandleWakeNotification", (), (), move |_, context, ()| {
            context.lock()?.handle_wake_notification();
            Ok(())
        });
        b.method(
            "HandleDisplayModeChange",
            ("mode",),
            (),
            move |_, context, (mode,): (u32,)| {
                let mode = parse_display_mode(mode).map_err(invalid_arg)?;
                context.lock()?.handle_display_mode_change(mode);
                Ok(())
            },
        );
        b.method(
            "SetLogLevel",
            ("level",),
            (),
            move |_, _, (level_raw,): (u8,)| {
                let level = parse_log_level(level_raw).map_err(invalid_arg)?;
                log::set_max_level(level);
                Ok(())
            },
        );

        // Advertise the signals.
        b.signal::<(i32, i32), _>(SUSPEND_IMMINENT, ("suspend_id", "reason"));
        b.signal::<(i32,), _>(DARK_SUSPEND_IMMINENT, ("suspend_id",));
        b.signal::<(i32, i64), _>(SUSPEND_DONE, ("suspend_id", "suspend_duration_us"));
    })
}

pub async fn service_main(prefs: DirectoryPrefsProvider) -> Result<()> {
    let root = Path::new("/");
    let config = SuspendConfig::load(&prefs, root).context("Failed to load preferences")?;

    let (io_resource, conn) = connection::new_system_sync()?;

    // io_resource must be awaited to start receiving D-Bus message.
    let _handle = tokio::spawn(async {
        let err = io_resource.await;
        panic!("Lost connection to D-Bus: {}", err);
    });

    conn.request_name(SERVICE_NAME, false, true, false).await?;

    let (event_loop, mut receiver) = TokioEventLoop::new();
    let event_loop: Arc<dyn EventLoop> = Arc::new(event_loop);
    let power_supply = DirectoryPowerSupply {
        root: root.to_path_buf(),
    };
    let suspender = Suspender::new(
        SystemDelegate::new(root, MetricsLogger::new(METRICS_CLIENT), SHUTDOWN_PROGRAM),
        DarkResumePolicy::new(power_supply.clone(), &config),
        ShutdownFromSuspendPolicy::new(power_supply, &config, event_loop.clone()),
        Arc::new(DbusSignalSender { conn: conn.clone() }),
        event_loop,
        Arc::new(BootClock),
        &config,
    );
    let context = DbusContext {
        suspender: Arc::new(Mutex::new(suspender)),
    };

    let mut cr = Crossroads::new();

    // Enable asynchronous methods. Incoming method calls are spawned as separate tasks if
    // necessary.
    cr.set_async_support(Some((
        conn.clone(),
        Box::new(|x| {
            tokio::spawn(x);
        }),
    )));

    let token = register_interface(&mut cr);
    cr.insert(PATH_NAME, &[token], context.clone());

    // Drop the delays of clients that leave the bus.
    let name_owner_changed_rule = MatchRule::new_signal(DBUS_INTERFACE_NAME, NAME_OWNER_CHANGED);
    conn.add_match_no_cb(&name_owner_changed_rule.match_str())
        .await?;
    let owner_context = context.clone();
    conn.start_receive(
        name_owner_changed_rule,
        Box::new(move |msg, _| {
            match msg.read3::<String, String, String>() {
                Ok((name, old_owner, new_owner)) => {
                    if !old_owner.is_empty() && new_owner.is_empty() {
                        if let Ok(mut suspender) = owner_context.lock() {
                            suspender.handle_owner_disconnected(&name);
                        }
                    }
                }
                Err(e) => error!("error reading D-Bus message {}. {}", NAME_OWNER_CHANGED, e),
            }
            true
        }),
    );

    conn.start_receive(
        MatchRule::new_method_call(),
        Box::new(move |msg, conn| match cr.handle_message(msg, conn) {
            Ok(()) => true,
            Err(()) => {
                error!("error handling D-Bus message");
                false
            }
        }),
    );

    info!("{} is ready", SERVICE_NAME);

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to watch SIGTERM")?;
    loop {
        tokio::select! {
            msg = receiver.recv() => match msg {
                Some(msg) => {
                    if let Ok(mut suspender) = context.lock() {
                        suspender.handle_loop_message(msg);
                    }
                }
                None => bail!("Event loop channel closed"),
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM; shutting down");
                if let Ok(mut suspender) = context.lock() {
                    suspender.handle_shutdown();
                }
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suspend_request() {
        assert_eq!(
            parse_suspend_request(NO_EXTERNAL_WAKEUP_COUNT, 0, 0).unwrap(),
            (None, None)
        );
        assert_eq!(
            parse_suspend_request(452, 5, 0).unwrap(),
            (Some(452), Some(Duration::from_secs(5)))
        );
        assert_eq!(parse_suspend_request(0, -3, 0).unwrap(), (Some(0), None));
        assert!(matches!(
            parse_suspend_request(NO_EXTERNAL_WAKEUP_COUNT, 0, 2),
            Err(PowerError::UnsupportedFlavor(2))
        ));
    }

    #[test]
    fn test_parse_delay_registration() {
        assert_eq!(
            parse_delay_registration(500, "network").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_delay_registration(0, "instant").unwrap(),
            Duration::ZERO
        );
        assert!(matches!(
            parse_delay_registration(-1, "network"),
            Err(PowerError::NegativeDelayTimeout(-1))
        ));
        assert!(matches!(
            parse_delay_registration(500, ""),
            Err(PowerError::EmptyDelayDescription)
        ));
    }

    #[test]
    fn test_parse_display_mode() {
        assert_eq!(parse_display_mode(0).unwrap(), DisplayMode::Normal);
        assert_eq!(parse_display_mode(1).unwrap(), DisplayMode::Presentation);
        assert!(matches!(
            parse_display_mode(7),
            Err(PowerError::InvalidDisplayMode(7))
        ));
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level(4).unwrap(), LevelFilter::Debug);
        assert!(matches!(
            parse_log_level(9),
            Err(PowerError::InvalidLogLevel(9))
        ));
    }
}
