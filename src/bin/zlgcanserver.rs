//! Bridges one ZLG channel to the `can_<channel>_in` / `can_<channel>_out`
//! named pipes.

#[cfg(windows)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::run().await
}

#[cfg(not(windows))]
fn main() {
    eprintln!("zlgcanserver serves Windows named pipes and is not supported on this platform");
    std::process::exit(1);
}

#[cfg(windows)]
mod server {
    use anyhow::Context;
    use clap::{ArgAction, Parser};
    use log::{error, info, warn};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::signal;
    use tokio::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    use zlg_can_utils::ipc::{encode_pipe_message, start_ipc_reader, start_ipc_writer};
    use zlg_can_utils::{BackendOptions, CanDriver, CanFrame, ZlgCanBackend, ZlgCanDriver};

    #[derive(Parser, Debug)]
    struct Cli {
        /// channel as TYPE[/DEVICE[/CHANNEL]], e.g. USBCANFD_200U/0/1
        channel: String,
        #[arg(short = 'b', long = "bitrate")]
        bitrate: Option<u32>,
        /// CAN-FD data-phase bit-rate (implies --fd)
        #[arg(short = 'd', long = "data-bitrate")]
        data_bitrate: Option<u32>,
        #[arg(long = "fd", action = ArgAction::SetTrue)]
        fd: bool,
        #[arg(long = "catalog", value_name = "FILE")]
        catalog: Option<PathBuf>,
        #[arg(long = "library", value_name = "FILE")]
        library: Option<PathBuf>,
        #[arg(long = "simulate", action = ArgAction::SetTrue)]
        simulate: bool,
    }

    async fn init_zlgcan(cli: &Cli) -> anyhow::Result<ZlgCanDriver> {
        let backend = ZlgCanBackend::with_options(&BackendOptions {
            catalog: cli.catalog.clone(),
            library: cli.library.clone(),
            simulate: cli.simulate,
        })
        .context("cannot initialise the ZLG backend")?;

        let mut driver = ZlgCanDriver::open(&backend, &cli.channel)
            .with_context(|| format!("could not find ZLG channel {}", cli.channel))?;

        if cli.fd || cli.data_bitrate.is_some() {
            driver.set_fd(cli.data_bitrate)?;
        }
        match cli.bitrate {
            Some(bitrate) => driver.set_bitrate(bitrate).await?,
            None => info!("No bitrate given, keeping the adapter default"),
        }
        driver.enable_timestamp().await?;
        driver
            .open_channel()
            .await
            .with_context(|| format!("could not open {}. Is the device connected?", cli.channel))?;

        info!("ZLG connected to {}", driver.device_label());
        Ok(driver)
    }

    pub async fn run() -> anyhow::Result<()> {
        env_logger::init();
        let cli = Cli::parse();

        let driver = init_zlgcan(&cli).await?;
        let pipe_channel = driver.device_label().to_string();
        let driver = Arc::new(Mutex::new(driver));

        let (tx_out_pipe, rx_out_pipe) = mpsc::channel::<Vec<u8>>(100);
        let (tx_in_pipe, mut rx_in_pipe) = mpsc::channel::<CanFrame>(100);

        tokio::spawn(start_ipc_reader(pipe_channel.clone(), tx_in_pipe));
        tokio::spawn(start_ipc_writer(pipe_channel.clone(), rx_out_pipe));

        let driver_in = driver.clone();
        let driver_out = driver.clone();

        // pipe -> CAN
        let mut task_in = tokio::spawn(async move {
            while let Some(frame) = rx_in_pipe.recv().await {
                let mut d = driver_in.lock().await;
                if let Err(e) = d.send_frame(&frame).await {
                    warn!("Failed to send CAN frame: {}", e);
                }
            }
        });

        // CAN -> pipe
        let mut task_out = tokio::spawn(async move {
            loop {
                let frames = driver_out.lock().await.read_frames().await;
                match frames {
                    Ok(frames) => {
                        for msg in frames.iter().filter_map(encode_pipe_message) {
                            let _ = tx_out_pipe.try_send(msg);
                        }
                    }
                    Err(e) => {
                        error!("Failed to read frames from CAN driver: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
            res = &mut task_in => {
                if let Err(e) = res { error!("Incoming task panicked: {:?}", e); }
                info!("Incoming task ended.");
            }
            res = &mut task_out => {
                if let Err(e) = res { error!("Outgoing task panicked: {:?}", e); }
                info!("Outgoing task ended.");
            }
        }

        // Workers hold the driver lock; stop them before closing.
        task_in.abort();
        task_out.abort();
        let _ = tokio::time::timeout(Duration::from_millis(200), async {
            let _ = task_in.await;
            let _ = task_out.await;
        })
        .await;

        match driver.lock().await.close_channel().await {
            Ok(()) => info!("CAN driver closed."),
            Err(e) => error!("Failed to close CAN driver: {}", e),
        }
        Ok(())
    }
}
