use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use log::{info, warn};
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use zlg_can_utils::{
    BackendOptions, BusEvent, CanFrame, ConfigKey, ConfigMap, ConfigValue, PumpConfig,
    ZlgCanBackend, spawn_pump,
};

/// Dumps traffic from one ZLG channel in candump format.
#[derive(Debug, Parser)]
#[command(name = "zlgcandump")]
#[command(about = "candump for ZLG USBCAN/USBCANFD adapters")]
struct Args {
    /// timestamp type: a (absolute), d (delta), z (zero), A (absolute w date)
    #[arg(short = 't', value_name = "type")]
    timestamp: Option<char>,

    /// print adapter timestamps instead of system timestamps
    #[arg(short = 'H', action = ArgAction::SetTrue)]
    hardware_ts: bool,

    /// terminate after reception of <count> CAN frames
    #[arg(short = 'n', value_name = "count")]
    count: Option<u64>,

    /// nominal bit-rate in bit/s
    #[arg(short = 'b', long = "bitrate")]
    bitrate: Option<u32>,

    /// CAN-FD data-phase bit-rate in bit/s (implies --fd)
    #[arg(short = 'd', long = "data-bitrate")]
    data_bitrate: Option<u32>,

    /// enable CAN-FD on capable adapters
    #[arg(long = "fd", action = ArgAction::SetTrue)]
    fd: bool,

    /// device catalog JSON file
    #[arg(long = "catalog", value_name = "FILE")]
    catalog: Option<PathBuf>,

    /// vendor library to load instead of the platform default
    #[arg(long = "library", value_name = "FILE")]
    library: Option<PathBuf>,

    /// use a simulated loopback adapter
    #[arg(long = "simulate", action = ArgAction::SetTrue)]
    simulate: bool,

    /// list the known adapter types and exit
    #[arg(long = "list", action = ArgAction::SetTrue)]
    list: bool,

    /// channel as TYPE[/DEVICE[/CHANNEL]], e.g. USBCANFD_200U/0/1
    #[arg(value_name = "IF", required_unless_present = "list")]
    interface: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum TimestampMode {
    None,
    Absolute,
    AbsoluteDate,
    Delta,
    Zero,
}

impl TimestampMode {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'a' => Some(Self::Absolute),
            'A' => Some(Self::AbsoluteDate),
            'd' => Some(Self::Delta),
            'z' => Some(Self::Zero),
            _ => None,
        }
    }
}

struct TimestampCtx {
    mode: TimestampMode,
    hardware: bool,
    start_instant: Instant,
    last_instant: Option<Instant>,
}

impl TimestampCtx {
    fn new(mode: TimestampMode, hardware: bool) -> Self {
        Self {
            mode,
            hardware,
            start_instant: Instant::now(),
            last_instant: None,
        }
    }

    /// Timestamp in microseconds, or `None` when timestamps are off.
    fn get_timestamp(&mut self, frame: &CanFrame) -> Option<u64> {
        if self.hardware {
            return Some(frame.timestamp());
        }

        match self.mode {
            TimestampMode::None => None,
            // TODO: -t A should print the calendar date.
            TimestampMode::Absolute | TimestampMode::AbsoluteDate => Some(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(0),
            ),
            TimestampMode::Delta => {
                let now = Instant::now();
                let ts = self
                    .last_instant
                    .map_or(0, |last| now.duration_since(last).as_micros() as u64);
                self.last_instant = Some(now);
                Some(ts)
            }
            TimestampMode::Zero => Some(self.start_instant.elapsed().as_micros() as u64),
        }
    }
}

fn format_frame(ts: Option<u64>, ifname: &str, frame: &CanFrame) -> String {
    let ts_str = ts.map_or(String::new(), |t| {
        format!("({}.{:06}) ", t / 1_000_000, t % 1_000_000)
    });

    let id = match frame.is_extended() {
        true => format!("{:08X}", frame.id()),
        false => format!("{:03X}", frame.id()),
    };

    let data = if frame.is_rtr() {
        "remote request".to_string()
    } else {
        frame
            .data()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let dlc = match frame.is_fd() {
        true => format!("{:02}", frame.dlc()),
        false => frame.dlc().to_string(),
    };

    format!("{}{} {:>08}   [{}]  {}", ts_str, ifname, id, dlc, data)
}

fn channel_config(args: &Args) -> ConfigMap {
    let mut config = ConfigMap::new();
    if args.fd || args.data_bitrate.is_some() {
        config.insert(ConfigKey::CanFd, ConfigValue::Bool(true));
    }
    if let Some(rate) = args.bitrate {
        config.insert(ConfigKey::BitRate, ConfigValue::UInt(rate));
    }
    if let Some(rate) = args.data_bitrate {
        config.insert(ConfigKey::DataBitRate, ConfigValue::UInt(rate));
    }
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let backend = ZlgCanBackend::with_options(&BackendOptions {
        catalog: args.catalog.clone(),
        library: args.library.clone(),
        simulate: args.simulate,
    })
    .context("cannot initialise the ZLG backend")?;

    if args.list {
        for device in backend.available_devices() {
            println!(
                "{:<16} channels: {}{}",
                device.name,
                device.channel_count,
                if device.fd_capable { "  (CAN-FD)" } else { "" }
            );
        }
        return Ok(());
    }

    let Some(interface) = args.interface.as_deref() else {
        bail!("no interface given");
    };
    let ts_mode = args
        .timestamp
        .and_then(TimestampMode::from_char)
        .unwrap_or(TimestampMode::None);
    let mut ts_ctx = TimestampCtx::new(ts_mode, args.hardware_ts);

    let channel = backend
        .open(interface, &channel_config(&args))
        .with_context(|| format!("cannot open {}", interface))?;
    info!(
        "Opened {} ({})",
        channel.label(),
        if channel.is_fd_enabled() { "CAN-FD" } else { "CAN" }
    );

    let mut events = channel.subscribe();
    let pump = spawn_pump(channel.clone(), PumpConfig::default());
    let mut received = 0u64;

    'dump: loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(BusEvent::FramesReceived(_)) | Err(RecvError::Lagged(_)) => {}
                    Ok(BusEvent::Error { kind, message }) => {
                        warn!("{:?} on {}: {}", kind, channel.label(), message);
                        continue;
                    }
                    Ok(BusEvent::FramesWritten(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
                for frame in channel.read_available() {
                    let ts = ts_ctx.get_timestamp(&frame);
                    println!("{}", format_frame(ts, interface, &frame));
                    received += 1;
                    if args.count.is_some_and(|count| received >= count) {
                        break 'dump;
                    }
                }
            }
        }
    }

    channel.close();
    if let Err(e) = pump.await {
        warn!("Pump task failed: {}", e);
    }
    Ok(())
}
