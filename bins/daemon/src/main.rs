use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use device::monitor::DeviceMonitor;
use engine::{Dhcp4Client, Dhcp6Client, EngineRegistry, IpAcquisitionEngine, Ipv4LinkLocal, LinkStateTracker, RouterDiscoveryClient};
use rtnl::{Groups, Link, LinkEvent, RtnlCache};

use crate::config::Config;

mod config;
mod ipc;

#[derive(Parser)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/netwatchd/config.toml")]
    config: PathBuf,

    /// Enables debug-level logging on STDOUT
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = if cli.config.exists() {
        Config::from_file(cli.config).context("loading config file")?
    } else {
        tracing::info!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(cfg))
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cfg: Config) -> Result<()> {
    let devices = device::enumerator::enumerate(&cfg.sys_root).context("enumerating /sys")?;
    tracing::info!(count = devices.len(), "enumerated devices at startup");

    let mut monitor = DeviceMonitor::new(cfg.sys_root.clone());
    monitor.start().context("starting device monitor")?;
    monitor.set_recv_buffer_size(cfg.recv_buf_size);

    let bus = match ipc::Bus::connect(&cfg.bus_name).await {
        Ok(bus) => Some(bus),
        Err(err) => {
            tracing::warn!(error = %err, "failed to connect to the system bus; continuing without IPC signals");
            None
        }
    };

    let cache = RtnlCache::connect(Groups::default()).context("opening route-netlink socket")?;
    cache.bootstrap().await.context("dumping links/addresses/routes")?;

    let registry: Rc<EngineRegistry<Rc<RtnlCache>>> = Rc::new(EngineRegistry::new());
    let trackers: Rc<RefCell<HashMap<u32, Rc<LinkStateTracker>>>> = Rc::new(RefCell::new(HashMap::new()));

    for link in cache.links() {
        register_link(&cache, &registry, &trackers, &link);
    }

    let link_registry = registry.clone();
    let link_trackers = trackers.clone();
    let link_cache = cache.clone();
    let _link_slot = cache.subscribe_links(move |event| match event {
        LinkEvent::New(link) => {
            if link_registry.contains(link.ifindex) {
                let tracker = link_trackers.borrow().get(&link.ifindex).cloned();
                if let Some(tracker) = tracker {
                    tracker.set_carrier(link.carrier);
                    let _ = link_registry.on_link_state(link.ifindex, tracker.observed_state());
                }
            } else {
                register_link(&link_cache, &link_registry, &link_trackers, link);
            }
        }
        LinkEvent::Del(link) => {
            if let Some(tracker) = link_trackers.borrow_mut().remove(&link.ifindex) {
                tracker.detach();
            }
            let _ = link_registry.remove(link.ifindex);
        }
    });

    let addr_registry = registry.clone();
    let addr_trackers = trackers.clone();
    let addr_cache = cache.clone();
    let _addr_slot = cache.subscribe_addresses(move |event| {
        let ifindex = match event {
            rtnl::AddressEvent::New(addr) | rtnl::AddressEvent::Del(addr) => addr.key.ifindex,
        };
        if let Some(tracker) = addr_trackers.borrow().get(&ifindex) {
            tracker.observe_ipv6ll(addr_cache.has_ipv6_link_local(ifindex));
            let _ = addr_registry.on_link_state(ifindex, tracker.observed_state());
        }
    });

    let cache_for_run = cache.clone();
    tokio::task::spawn_local(async move {
        if let Err(err) = cache_for_run.run().await {
            tracing::error!(error = %err, "route-netlink cache loop exited");
        }
    });

    tracing::info!("netwatchd started");

    loop {
        tokio::select! {
            event = monitor.recv() => {
                match event {
                    Ok(Some(event)) => {
                        tracing::debug!(action = %event.action, seqnum = event.seqnum, devpath = event.record.devpath(), "device event");
                        if let Some(bus) = &bus {
                            if let Err(err) = bus.emit(&event).await {
                                tracing::warn!(error = %err, "failed to emit IPC signal");
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::warn!(error = %err, "device monitor error"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

fn register_link(
    cache: &Rc<RtnlCache>,
    registry: &Rc<EngineRegistry<Rc<RtnlCache>>>,
    trackers: &Rc<RefCell<HashMap<u32, Rc<LinkStateTracker>>>>,
    link: &Link,
) {
    if link.loopback {
        return;
    }

    let tracker = Rc::new(LinkStateTracker::new());
    tracker.set_carrier(link.carrier);
    tracker.observe_ipv6ll(cache.has_ipv6_link_local(link.ifindex));

    let hw_addr = hardware_address(link);

    let engine = IpAcquisitionEngine::new(
        link.ifindex,
        hw_addr,
        seed_from_hw_addr(hw_addr),
        cache.clone(),
        Rc::new(Ipv4LinkLocal::new()),
        Rc::new(Dhcp4Client::new()),
        Rc::new(Dhcp6Client::new()),
        Rc::new(RouterDiscoveryClient::new()),
    );

    if registry.insert(link.ifindex, engine, tracker.observed_state()).is_ok() {
        trackers.borrow_mut().insert(link.ifindex, tracker);
    }
}

fn hardware_address(link: &Link) -> [u8; 6] {
    let mut hw_addr = [0u8; 6];
    if let Some(addr) = &link.address {
        let len = addr.len().min(6);
        hw_addr[..len].copy_from_slice(&addr[..len]);
    }
    hw_addr
}

/// A stable per-link seed for `ipv4ll`'s address selection, derived
/// from the interface's hardware address rather than randomness so
/// repeated runs on the same link probe the same first candidate.
fn seed_from_hw_addr(hw_addr: [u8; 6]) -> u64 {
    let mut seed = 0u64;
    for byte in hw_addr {
        seed = (seed << 8) | u64::from(byte);
    }
    seed
}
