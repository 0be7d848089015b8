//! End-to-end runs of the flashing pipeline against a scripted serial port
//!
//! The port answers like the ROM loader does (multiple SYNC replies,
//! status bytes leading the data section) so the full state machine runs
//! without hardware.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use c3flash::firmware::{FirmwareBundle, FirmwareImage, APPLICATION_OFFSET};
use c3flash::flasher::{BaudRate, Flasher, FlashingState, PortOpener, FLASH_BLOCK_SIZE};
use c3flash::interface::{
    DeviceDescriptor, SerialError, Transport, USB_SERIAL_JTAG_PID, USB_SERIAL_JTAG_VID,
};
use c3flash::slip;
use c3flash::ErrorKind;

const SYNC: u8 = 0x08;
const FLASH_BEGIN: u8 = 0x02;
const FLASH_DATA: u8 = 0x03;
const FLASH_END: u8 = 0x04;
const WRITE_REG: u8 = 0x09;
const READ_REG: u8 = 0x0A;
const SPI_ATTACH: u8 = 0x0D;
const CHANGE_BAUD: u8 = 0x0F;

#[derive(Debug, Clone)]
struct WireCommand {
    opcode: u8,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct PortState {
    written: Vec<WireCommand>,
    baud_changes: Vec<u32>,
}

impl PortState {
    fn opcodes(&self) -> Vec<u8> {
        self.written.iter().map(|command| command.opcode).collect()
    }
}

/// A fake serial port that plays the ROM loader's side of the exchange
struct ScriptedPort {
    rx: VecDeque<u8>,
    state: Arc<Mutex<PortState>>,
    /// Respond with status=1 to the FLASH_DATA block with this sequence
    fail_data_block: Option<u32>,
}

impl ScriptedPort {
    fn new() -> (Self, Arc<Mutex<PortState>>) {
        let state = Arc::new(Mutex::new(PortState::default()));
        let port = ScriptedPort {
            rx: VecDeque::new(),
            state: state.clone(),
            fail_data_block: None,
        };

        (port, state)
    }

    fn queue_response(&mut self, opcode: u8, value: u32, status: u8, error: u8) {
        let mut packet = vec![0x01, opcode];
        packet.extend((4u16).to_le_bytes());
        packet.extend(value.to_le_bytes());
        packet.extend([status, error, 0, 0]);
        self.rx.extend(slip::encode(&packet));
    }
}

impl Transport for ScriptedPort {
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, SerialError> {
        if self.rx.is_empty() {
            sleep(timeout.min(Duration::from_millis(1)));
            return Ok(Vec::new());
        }

        let n = self.rx.len().min(4096);
        Ok(self.rx.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let packet = slip::decode(data);
        assert!(packet.len() >= 8, "command shorter than its header");

        let opcode = packet[1];
        let payload = packet[8..].to_vec();
        self.state.lock().unwrap().written.push(WireCommand {
            opcode,
            payload: payload.clone(),
        });

        match opcode {
            // The ROM replies to one SYNC many times over.
            SYNC => {
                for _ in 0..8 {
                    self.queue_response(SYNC, 0, 0, 0);
                }
            }
            READ_REG => self.queue_response(READ_REG, 0x8000_0000, 0, 0),
            WRITE_REG => self.queue_response(WRITE_REG, 0, 0, 0),
            SPI_ATTACH => self.queue_response(SPI_ATTACH, 0, 0, 0),
            FLASH_BEGIN => self.queue_response(FLASH_BEGIN, 0, 0, 0),
            FLASH_DATA => {
                let sequence = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                if self.fail_data_block == Some(sequence) {
                    self.queue_response(FLASH_DATA, 0, 1, 6);
                } else {
                    self.queue_response(FLASH_DATA, 0, 0, 0);
                }
            }
            // No CHANGE_BAUD or FLASH_END responses: the host does not
            // wait for the former and tolerates silence on the latter.
            _ => {}
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        self.rx.clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), SerialError> {
        self.state.lock().unwrap().baud_changes.push(baud);
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), SerialError> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<(), SerialError> {
        Ok(())
    }

    fn set_dtr_rts(&mut self, _dtr: bool, _rts: bool) -> Result<(), SerialError> {
        Ok(())
    }
}

fn single_use_opener(port: ScriptedPort) -> Arc<PortOpener> {
    let slot = Mutex::new(Some(port));
    Arc::new(move |_path: &str| {
        slot.lock()
            .unwrap()
            .take()
            .map(|port| Box::new(port) as Box<dyn Transport>)
            .ok_or(SerialError::Disconnected)
    })
}

fn usb_jtag_device() -> DeviceDescriptor {
    DeviceDescriptor {
        path: "/dev/ttyACM0".to_string(),
        name: "USB JTAG/serial debug unit".to_string(),
        vid: Some(USB_SERIAL_JTAG_VID),
        pid: Some(USB_SERIAL_JTAG_PID),
    }
}

fn app_bundle(size: usize) -> FirmwareBundle {
    let mut data = vec![0x55u8; size];
    data[0] = 0xE9;

    FirmwareBundle::from_images(vec![FirmwareImage {
        path: "firmware.bin".into(),
        data,
        offset: APPLICATION_OFFSET,
    }])
}

fn collect_events(receiver: &Receiver<FlashingState>) -> Vec<FlashingState> {
    let mut events = Vec::new();
    loop {
        match receiver.recv_timeout(Duration::from_secs(30)) {
            Ok(state) => {
                let terminal = !state.is_active() && state != FlashingState::Idle;
                events.push(state);
                if terminal {
                    return events;
                }
            }
            Err(_) => return events,
        }
    }
}

/// Watchdog disarming is two unlock/modify/lock register bursts
const WATCHDOG_OPCODES: [u8; 8] = [
    WRITE_REG, READ_REG, WRITE_REG, WRITE_REG, WRITE_REG, READ_REG, WRITE_REG, WRITE_REG,
];

#[test]
fn happy_path_at_default_baud() {
    // 1.5 blocks: the second FLASH_DATA must be padded up with 0xFF.
    let bundle = app_bundle(1536);
    let (port, state) = ScriptedPort::new();
    let (flasher, events) = Flasher::with_opener(single_use_opener(port));

    flasher.flash(bundle, usb_jtag_device(), BaudRate::Baud115200);
    let events = collect_events(&events);

    assert_eq!(events[0], FlashingState::Connecting);
    assert_eq!(events[1], FlashingState::Syncing);
    assert_eq!(events[2], FlashingState::Erasing);
    assert_eq!(events[3], FlashingState::Flashing { progress: 0.5 });
    assert_eq!(events[4], FlashingState::Flashing { progress: 1.0 });
    assert_eq!(events[5], FlashingState::Verifying);
    assert_eq!(events[6], FlashingState::Restarting);
    assert_eq!(events[7], FlashingState::Complete);
    assert_eq!(events.len(), 8);

    let state = state.lock().unwrap();
    let mut expected = vec![SYNC];
    expected.extend(WATCHDOG_OPCODES);
    expected.extend([SPI_ATTACH, FLASH_BEGIN, FLASH_DATA, FLASH_DATA, FLASH_END]);
    assert_eq!(state.opcodes(), expected);

    // FLASH_BEGIN announces two 1024-byte blocks.
    let begin = state
        .written
        .iter()
        .find(|command| command.opcode == FLASH_BEGIN)
        .unwrap();
    assert_eq!(&begin.payload[0..4], &1536u32.to_le_bytes());
    assert_eq!(&begin.payload[4..8], &2u32.to_le_bytes());
    assert_eq!(&begin.payload[8..12], &(FLASH_BLOCK_SIZE as u32).to_le_bytes());
    assert_eq!(&begin.payload[12..16], &APPLICATION_OFFSET.to_le_bytes());

    // The short final block is padded to a full one with 0xFF.
    let blocks: Vec<&WireCommand> = state
        .written
        .iter()
        .filter(|command| command.opcode == FLASH_DATA)
        .collect();
    assert_eq!(&blocks[0].payload[4..8], &0u32.to_le_bytes());
    assert_eq!(&blocks[1].payload[4..8], &1u32.to_le_bytes());

    let last_block = &blocks[1].payload[16..];
    assert_eq!(last_block.len(), FLASH_BLOCK_SIZE);
    assert!(last_block[512..].iter().all(|byte| *byte == 0xFF));

    assert!(state.baud_changes.is_empty());
}

#[test]
fn happy_path_negotiates_higher_baud() {
    let bundle = app_bundle(1024);
    let (port, state) = ScriptedPort::new();
    let (flasher, events) = Flasher::with_opener(single_use_opener(port));

    flasher.flash(bundle, usb_jtag_device(), BaudRate::Baud921600);
    let events = collect_events(&events);

    assert_eq!(events[0], FlashingState::Connecting);
    assert_eq!(events[1], FlashingState::Syncing);
    assert_eq!(events[2], FlashingState::ChangingBaudRate);
    assert_eq!(events[3], FlashingState::Erasing);
    assert_eq!(events.last(), Some(&FlashingState::Complete));

    let state = state.lock().unwrap();
    assert_eq!(state.baud_changes, vec![921_600]);

    // CHANGE_BAUD goes out after the watchdog registers, then a second
    // sync confirms the new speed before SPI attach.
    let mut expected = vec![SYNC];
    expected.extend(WATCHDOG_OPCODES);
    expected.extend([CHANGE_BAUD, SYNC, SPI_ATTACH, FLASH_BEGIN, FLASH_DATA, FLASH_END]);
    assert_eq!(state.opcodes(), expected);

    let change = state
        .written
        .iter()
        .find(|command| command.opcode == CHANGE_BAUD)
        .unwrap();
    assert_eq!(&change.payload[0..4], &921_600u32.to_le_bytes());
    assert_eq!(&change.payload[4..8], &115_200u32.to_le_bytes());
}

#[test]
fn classic_device_skips_watchdog_disable() {
    let bundle = app_bundle(1024);
    let (port, state) = ScriptedPort::new();
    let (flasher, events) = Flasher::with_opener(single_use_opener(port));

    let bridge = DeviceDescriptor {
        path: "/dev/ttyUSB0".to_string(),
        name: "CP2102 USB to UART Bridge Controller".to_string(),
        vid: Some(0x10C4),
        pid: Some(0xEA60),
    };
    flasher.flash(bundle, bridge, BaudRate::Baud115200);
    let events = collect_events(&events);

    assert_eq!(events.last(), Some(&FlashingState::Complete));

    // No watchdog traffic on a UART bridge.
    let state = state.lock().unwrap();
    assert_eq!(
        state.opcodes(),
        vec![SYNC, SPI_ATTACH, FLASH_BEGIN, FLASH_DATA, FLASH_END]
    );
}

#[test]
fn failing_block_aborts_the_run() {
    let bundle = app_bundle(5 * FLASH_BLOCK_SIZE);
    let (mut port, state) = ScriptedPort::new();
    port.fail_data_block = Some(3);
    let (flasher, events) = Flasher::with_opener(single_use_opener(port));

    flasher.flash(bundle, usb_jtag_device(), BaudRate::Baud115200);
    let events = collect_events(&events);

    match events.last() {
        Some(FlashingState::Error { kind, data, .. }) => {
            assert_eq!(*kind, ErrorKind::FlashDataFailed);
            assert_eq!(*data, 3);
        }
        other => panic!("expected a flash data error, got {other:?}"),
    }

    let state = state.lock().unwrap();
    let data_blocks = state
        .written
        .iter()
        .filter(|command| command.opcode == FLASH_DATA)
        .count();
    assert_eq!(data_blocks, 4, "no blocks may follow the failed one");
    assert!(!state.opcodes().contains(&FLASH_END));
}

#[test]
fn cancellation_stops_within_a_block() {
    let bundle = app_bundle(100 * FLASH_BLOCK_SIZE);
    let (port, state) = ScriptedPort::new();
    let (flasher, events) = Flasher::with_opener(single_use_opener(port));

    flasher.flash(bundle, usb_jtag_device(), BaudRate::Baud115200);

    let mut cancelled = false;
    let mut terminal = None;
    while let Ok(event) = events.recv_timeout(Duration::from_secs(30)) {
        if let FlashingState::Flashing { progress } = event {
            if progress >= 0.3 && !cancelled {
                flasher.cancel();
                cancelled = true;
            }
            continue;
        }
        if !event.is_active() {
            terminal = Some(event);
            break;
        }
    }

    assert!(cancelled, "never reached 30% progress");
    match terminal {
        Some(FlashingState::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }

    // The run stopped without finalizing the flash.
    let state = state.lock().unwrap();
    assert!(!state.opcodes().contains(&FLASH_END));

    // And the service becomes available again.
    for _ in 0..50 {
        if !flasher.is_flashing() {
            return;
        }
        sleep(Duration::from_millis(20));
    }
    panic!("service still reports an active flash");
}

#[test]
fn invalid_firmware_is_rejected_before_opening_the_port() {
    let bundle = FirmwareBundle::from_images(vec![FirmwareImage {
        path: "broken.bin".into(),
        data: vec![0x00; 64],
        offset: APPLICATION_OFFSET,
    }]);
    let (port, state) = ScriptedPort::new();
    let (flasher, events) = Flasher::with_opener(single_use_opener(port));

    flasher.flash(bundle, usb_jtag_device(), BaudRate::Baud115200);
    let events = collect_events(&events);

    match events.last() {
        Some(FlashingState::Error { kind, .. }) => {
            assert_eq!(*kind, ErrorKind::InvalidFirmware)
        }
        other => panic!("expected an invalid firmware error, got {other:?}"),
    }

    assert!(state.lock().unwrap().written.is_empty());
}
