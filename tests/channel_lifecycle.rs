use std::sync::Arc;
use std::thread;

use zlg_can_utils::native::mock::{MockApi, MockCall};
use zlg_can_utils::{
    ChannelState, ConfigKey, ConfigMap, ConfigValue, DeviceCatalog, Error, ZlgCanBackend,
};

const USBCAN_8E_U: u32 = 34;

fn backend() -> (Arc<MockApi>, ZlgCanBackend) {
    let api = Arc::new(MockApi::new());
    let backend = ZlgCanBackend::new(DeviceCatalog::builtin().unwrap(), api.clone());
    (api, backend)
}

#[test]
fn concurrent_opens_share_one_device_handle() {
    let (api, backend) = backend();

    let channels: Vec<_> = thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|index| {
                let backend = &backend;
                s.spawn(move || {
                    backend
                        .open(&format!("USBCAN_8E_U/0/{}", index), &ConfigMap::new())
                        .unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(api.device_opens(), 1);
    assert_eq!(
        backend.registry().holders(USBCAN_8E_U, 0),
        (0..8).collect::<Vec<_>>()
    );
    assert!(channels.iter().all(|c| c.state() == ChannelState::Open));
    let shared = backend.registry().device_handle(USBCAN_8E_U, 0);
    assert!(shared.is_some());

    let mut channels = channels;
    let last = channels.pop().unwrap();
    for channel in &channels {
        channel.close();
    }
    assert_eq!(api.device_closes(), 0);
    assert_eq!(backend.registry().holders(USBCAN_8E_U, 0), vec![7]);
    assert_eq!(backend.registry().device_handle(USBCAN_8E_U, 0), shared);

    last.close();
    assert_eq!(api.device_closes(), 1);
    assert!(backend.registry().is_empty());
    assert_eq!(backend.registry().device_handle(USBCAN_8E_U, 0), None);
}

#[test]
fn second_controller_for_a_held_channel_is_refused() {
    let (api, backend) = backend();
    let first = backend.open("USBCAN_8E_U/0/3", &ConfigMap::new()).unwrap();
    let second = backend.create_channel("USBCAN_8E_U/0/3").unwrap();

    assert!(matches!(
        second.open(),
        Err(Error::AlreadyOpen {
            device_type: USBCAN_8E_U,
            device_index: 0,
            channel_index: 3,
        })
    ));
    assert_eq!(second.state(), ChannelState::Closed);
    assert_eq!(first.state(), ChannelState::Open);
    assert_eq!(api.device_opens(), 1);
}

#[test]
fn dropping_an_open_channel_releases_the_device() {
    let (api, backend) = backend();
    let channel = backend.open("USBCAN2/1/0", &ConfigMap::new()).unwrap();
    drop(channel);

    assert_eq!(api.device_closes(), 1);
    assert_eq!(api.open_devices(), 0);
    assert!(backend.registry().is_empty());
}

#[test]
fn failed_configuration_rolls_back_the_device() {
    let (api, backend) = backend();
    api.fail_path("0/canfd_abit_baud_rate");
    let config = ConfigMap::from([
        (ConfigKey::CanFd, ConfigValue::Bool(true)),
        (ConfigKey::BitRate, ConfigValue::UInt(500_000)),
    ]);

    let Err(err) = backend.open("USBCANFD_200U/0/0", &config) else {
        panic!("open with a rejected bit-rate should fail");
    };
    assert!(matches!(err, Error::ConfigurationFailed(_)));
    assert_eq!(api.call_count(MockCall::InitCan), 0);
    assert_eq!(api.open_devices(), 0);
    assert!(backend.registry().is_empty());
}

#[test]
fn reopen_after_close_runs_the_full_sequence_again() {
    let (api, backend) = backend();
    let channel = backend.open("USBCAN2/0/1", &ConfigMap::new()).unwrap();
    channel.close();
    channel.close();
    assert_eq!(channel.state(), ChannelState::Closed);

    channel.open().unwrap();
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(api.device_opens(), 2);
    assert_eq!(api.call_count(MockCall::StartCan), 2);
}
