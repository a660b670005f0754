use std::io::ErrorKind;
use std::sync::Arc;

use zlg_can_utils::native::mock::{MockApi, MockCall, classic_rx};
use zlg_can_utils::{CanDriver, CanFrame, ChannelState, DeviceCatalog, ZlgCanBackend, ZlgCanDriver};

fn driver(interface: &str) -> (Arc<MockApi>, ZlgCanDriver) {
    let api = Arc::new(MockApi::with_loopback());
    let backend = ZlgCanBackend::new(DeviceCatalog::builtin().unwrap(), api.clone());
    let driver = ZlgCanDriver::open(&backend, interface).unwrap();
    (api, driver)
}

#[tokio::test]
async fn classic_round_trip_through_the_driver() {
    let (api, mut driver) = driver("USBCAN2/0/1");
    driver.set_bitrate(250_000).await.unwrap();
    driver.enable_timestamp().await.unwrap();
    driver.open_channel().await.unwrap();
    assert_eq!(driver.get_bitrate().await, Some(250_000));

    let frame = CanFrame::new_eff(0x18FF_0001, &[1, 2, 3, 4]);
    driver.send_frame(&frame).await.unwrap();
    assert_eq!(api.transmitted().len(), 1);

    let frames = driver.read_frames().await.unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].id(), 0x18FF_0001);
    assert!(frames[0].is_extended());
    assert_eq!(frames[0].data(), &[1, 2, 3, 4]);

    assert!(driver.read_frames().await.unwrap().is_empty());

    driver.close_channel().await.unwrap();
    assert_eq!(driver.controller().state(), ChannelState::Closed);
}

#[tokio::test]
async fn fd_frames_need_fd_enabled() {
    let (_api, mut driver) = driver("USBCANFD_200U/0/0");
    driver.open_channel().await.unwrap();

    let frame = CanFrame::new_fd(0x42, &[0; 12], false, false);
    let err = driver.send_frame(&frame).await.unwrap_err();
    assert!(err.to_string().contains("CAN FD is not enabled"));

    driver.close_channel().await.unwrap();
    driver.set_fd(Some(2_000_000)).unwrap();
    driver.open_channel().await.unwrap();
    assert!(driver.controller().is_fd_enabled());
    driver.send_frame(&frame).await.unwrap();
    let frames = driver.read_frames().await.unwrap();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_fd());
    assert_eq!(frames[0].id(), 0x42);
    assert_eq!(frames[0].data(), frame.data());
}

#[tokio::test]
async fn sending_before_open_fails() {
    let (_api, mut driver) = driver("USBCAN2/0/0");
    let err = driver
        .send_frame(&CanFrame::new(0x1, &[0]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn fd_is_refused_on_classic_devices() {
    let (_api, mut driver) = driver("USBCAN2/0/0");
    assert!(driver.set_fd(None).is_err());
}

#[tokio::test]
async fn oversized_frames_are_dropped_without_an_error() {
    let (api, mut driver) = driver("USBCAN2/0/0");
    driver.open_channel().await.unwrap();

    driver.send_frame(&CanFrame::new(0x7, &[0; 9])).await.unwrap();
    assert!(api.transmitted().is_empty());
    assert_eq!(api.call_count(MockCall::Transmit), 0);
}

#[tokio::test]
async fn earlier_read_failure_does_not_fail_a_send() {
    let (api, mut driver) = driver("USBCAN2/0/0");
    driver.open_channel().await.unwrap();
    api.push_receive(0, classic_rx(0x10, &[1], 1));
    api.fail(MockCall::Receive);

    assert!(driver.read_frames().await.unwrap().is_empty());
    assert!(driver.controller().last_error().is_some());

    driver.send_frame(&CanFrame::new(0x11, &[2])).await.unwrap();
    assert_eq!(api.transmitted().len(), 1);
}
