use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::process::ExitCode;
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use device::monitor::DeviceMonitor;
use device::record::{Action, DeviceRecord, DEFAULT_SYS_ROOT};
use futures_util::stream::select_all;
use futures_util::StreamExt;
use zbus::Connection;

/// Well-known name and path the daemon's D-Bus surface is served at
/// (mirrors `bins/daemon/src/ipc.rs`).
const BUS_WELL_KNOWN_NAME: &str = "org.freedesktop.device1";
const BUS_OBJECT_PATH: &str = "/org/freedesktop/device1";
const BUS_INTERFACE: &str = "org.freedesktop.device1.Device";

/// Client-side mirror of `bins/daemon/src/ipc.rs`'s `DeviceSignals`
/// interface. Each `receive_*_device` method (generated by the
/// `#[zbus::proxy]` macro) yields a stream of that one signal; the
/// six are merged below into a single unified stream.
#[zbus::proxy(
    interface = "org.freedesktop.device1.Device",
    default_path = "/org/freedesktop/device1",
    default_service = "org.freedesktop.device1"
)]
trait Device {
    #[zbus(signal)]
    fn add_device(&self, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn change_device(&self, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn remove_device(&self, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn move_device(&self, seqnum: u64, old_devpath: String, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn online_device(&self, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn offline_device(&self, seqnum: u64, properties: HashMap<String, String>) -> zbus::Result<()>;
}

/// One decoded bus signal, normalised to the same shape the kernel
/// path prints from (§6): the action it carries and the `DEVPATH`
/// property the daemon always includes.
struct BusEvent {
    action: Action,
    devpath: String,
}

fn devpath_of(properties: &HashMap<String, String>) -> String {
    properties.get("DEVPATH").cloned().unwrap_or_default()
}

#[derive(Parser)]
#[command(name = "device-cli", version)]
struct Cli {
    /// Show every property, not just the common ones
    #[arg(short, long, global = true)]
    all: bool,

    /// Never pipe output through a pager
    #[arg(long, global = true)]
    no_pager: bool,

    /// Omit the column header row
    #[arg(long, global = true)]
    no_legend: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch kernel events and bridged bus signals
    Monitor,
    /// Enumerate all devices
    List,
    /// Show one device's properties
    Show {
        #[arg(value_name = "SYSPATH")]
        syspath: Option<String>,
    },
    /// Write "change" to every discovered device's uevent file
    Trigger,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap has already written help/usage to the right stream.
            err.print().ok();
            return if err.exit_code() == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE };
        }
    };

    let Some(command) = cli.command else {
        Cli::command().print_help().ok();
        return ExitCode::SUCCESS;
    };

    match dispatch(command, &cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}: {err}", "error".red());
            ExitCode::FAILURE
        }
    }
}

fn dispatch(command: Command, cli: &Cli) -> anyhow::Result<()> {
    match command {
        Command::List => list(DEFAULT_SYS_ROOT, cli),
        Command::Show { syspath } => show(DEFAULT_SYS_ROOT, syspath, cli),
        Command::Trigger => trigger(DEFAULT_SYS_ROOT),
        Command::Monitor => {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            rt.block_on(monitor())
        }
    }
}

fn list(sys_root: &str, cli: &Cli) -> anyhow::Result<()> {
    let devices = device::enumerator::enumerate(sys_root)?;

    if !cli.no_legend {
        println!("{:<10} {:<12} {}", "SUBSYSTEM", "ID", "SYSPATH");
    }
    for device in &devices {
        print_summary(device, cli.all);
    }
    Ok(())
}

fn show(sys_root: &str, syspath: Option<String>, cli: &Cli) -> anyhow::Result<()> {
    let syspath = syspath.ok_or_else(|| anyhow::anyhow!("invalid number of arguments"))?;

    let record = DeviceRecord::from_syspath(sys_root, syspath)?;
    print_summary(&record, true);
    if cli.all {
        for (key, value) in record.properties().iter() {
            println!("  {key}={value}");
        }
    }
    Ok(())
}

fn trigger(sys_root: &str) -> anyhow::Result<()> {
    let devices = device::enumerator::enumerate(sys_root)?;
    for device in &devices {
        let uevent_path = format!("{}/uevent", device.syspath());
        match OpenOptions::new().write(true).open(&uevent_path) {
            Ok(mut file) => {
                if let Err(err) = file.write_all(b"change") {
                    tracing::warn!(path = %uevent_path, error = %err, "failed to trigger device");
                }
            }
            Err(err) => tracing::warn!(path = %uevent_path, error = %err, "failed to open uevent file"),
        }
    }
    Ok(())
}

async fn monitor() -> anyhow::Result<()> {
    let mut monitor = DeviceMonitor::new(DEFAULT_SYS_ROOT);
    monitor.start()?;

    let mut bus_events = connect_bus_events().await;

    let start = Instant::now();
    loop {
        tokio::select! {
            kernel_event = monitor.recv() => {
                match kernel_event {
                    Ok(Some(event)) => {
                        let elapsed = start.elapsed();
                        let glyph = colour_for_action(event.action);
                        println!(
                            "{:>6}.{:06} KERNEL  {} {}",
                            elapsed.as_secs(),
                            elapsed.subsec_micros(),
                            glyph,
                            event.record.devpath()
                        );
                    }
                    Ok(None) => {}
                    Err(err) => tracing::debug!(error = %err, "dropping malformed uevent"),
                }
            }
            Some(bus_event) = next(&mut bus_events) => {
                let elapsed = start.elapsed();
                let glyph = colour_for_action(bus_event.action);
                println!(
                    "{:>6}.{:06} DEVICED+ {} {}",
                    elapsed.as_secs(),
                    elapsed.subsec_micros(),
                    glyph,
                    bus_event.devpath
                );
            }
        }
    }
}

/// Polls the merged bus-signal stream, if one was established; stays
/// pending forever when there isn't one so `tokio::select!` simply
/// never picks this branch and the kernel path runs on its own.
async fn next(events: &mut Option<BusEventStream>) -> Option<BusEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

type BusEventStream = std::pin::Pin<Box<dyn futures_util::Stream<Item = BusEvent> + Send>>;

/// Connects to the system bus and subscribes to the daemon's
/// `org.freedesktop.device1.Device` signals (mirrors `BUS_INTERFACE`
/// in `bins/daemon/src/ipc.rs`). The daemon's IPC surface is not
/// load-bearing (see DESIGN.md): if the bus or the daemon is
/// unreachable, this returns `None` and `monitor` falls back to
/// kernel-only output rather than failing outright.
async fn connect_bus_events() -> Option<BusEventStream> {
    let connection = match Connection::system().await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(error = %err, "system bus unavailable, showing kernel events only");
            return None;
        }
    };

    let proxy = match DeviceProxy::builder(&connection)
        .destination(BUS_WELL_KNOWN_NAME)
        .ok()?
        .path(BUS_OBJECT_PATH)
        .ok()?
        .interface(BUS_INTERFACE)
        .ok()?
        .build()
        .await
    {
        Ok(proxy) => proxy,
        Err(err) => {
            tracing::warn!(error = %err, "device daemon not reachable over D-Bus, showing kernel events only");
            return None;
        }
    };

    let add = proxy.receive_add_device().await.ok()?;
    let change = proxy.receive_change_device().await.ok()?;
    let remove = proxy.receive_remove_device().await.ok()?;
    let mv = proxy.receive_move_device().await.ok()?;
    let online = proxy.receive_online_device().await.ok()?;
    let offline = proxy.receive_offline_device().await.ok()?;

    let streams: Vec<BusEventStream> = vec![
        Box::pin(add.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(BusEvent { action: Action::Add, devpath: devpath_of(&args.properties) })
        })),
        Box::pin(change.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(BusEvent { action: Action::Change, devpath: devpath_of(&args.properties) })
        })),
        Box::pin(remove.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(BusEvent { action: Action::Remove, devpath: devpath_of(&args.properties) })
        })),
        Box::pin(mv.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(BusEvent { action: Action::Move, devpath: devpath_of(&args.properties) })
        })),
        Box::pin(online.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(BusEvent { action: Action::Online, devpath: devpath_of(&args.properties) })
        })),
        Box::pin(offline.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(BusEvent { action: Action::Offline, devpath: devpath_of(&args.properties) })
        })),
    ];

    Some(Box::pin(select_all(streams)))
}

fn colour_for_action(action: Action) -> colored::ColoredString {
    let label = action.to_string();
    match action {
        Action::Add | Action::Online => label.green(),
        Action::Remove | Action::Offline => label.red(),
        Action::Change | Action::Move => label.blue(),
    }
}

fn print_summary(device: &DeviceRecord, verbose: bool) {
    println!(
        "{:<10} {:<12} {}",
        device.subsystem().unwrap_or("-"),
        device.device_id(),
        device.syspath()
    );
    if verbose {
        if let Some(devnode) = device.devnode() {
            println!("  devnode: {devnode}");
        }
        if let Some(driver) = device.driver() {
            println!("  driver: {driver}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_requests_help_and_succeeds() {
        let cli = Cli::try_parse_from(["device-cli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn show_without_a_syspath_is_an_invalid_argument_count() {
        let cli = Cli::try_parse_from(["device-cli", "show"]).unwrap();
        let err = show(DEFAULT_SYS_ROOT, None, &cli).unwrap_err();
        assert!(err.to_string().contains("invalid number of arguments"));
    }

    #[test]
    fn trigger_writes_the_six_byte_change_string() {
        let dir = std::env::temp_dir().join(format!("device-cli-test-{}", std::process::id()));
        let devdir = dir.join("devices/virtual/net/eth0");
        std::fs::create_dir_all(&devdir).unwrap();
        std::fs::write(devdir.join("uevent"), b"").unwrap();

        let sys_root = dir.to_str().unwrap();
        trigger(sys_root).unwrap();

        let written = std::fs::read(devdir.join("uevent")).unwrap();
        assert_eq!(written, b"change");
        assert_eq!(written.len(), 6);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn colours_match_action_class() {
        assert_eq!(colour_for_action(Action::Add).to_string(), "add".green().to_string());
        assert_eq!(colour_for_action(Action::Remove).to_string(), "remove".red().to_string());
        assert_eq!(colour_for_action(Action::Change).to_string(), "change".blue().to_string());
    }
}
