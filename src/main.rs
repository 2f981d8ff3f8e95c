//! tapbeacon firmware: tap-coded cards out, invisible beacons on air.
//!
//! Samples the watch's QMI8658 at 50 Hz, decodes tap gestures into playing
//! cards, and broadcasts each card as a burst of WiFi beacons whose SSID
//! hides the card in zero-width characters. Tap, gesture and card events are
//! streamed as NDJSON over serial and a Nordic-UART style GATT service, which
//! also accepts tuning commands.

#![no_std]
#![no_main]

extern crate alloc;

use esp_backtrace as _;

esp_bootloader_esp_idf::esp_app_desc!();

use tapbeacon::{beacon, board, comm, defaults, protocol};

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker, Timer};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::interrupt::software::SoftwareInterruptControl;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::Blocking;
use static_cell::StaticCell;

use trouble_host::prelude::*;

use tapbeacon::accel::Qmi8658;
use tapbeacon::beacon::{Burst, CardMailbox, RadioError};
use tapbeacon::card::Card;
use tapbeacon::comm::{CommandEffect, LineReader};
use tapbeacon::config::Config;
use tapbeacon::decoder::FeedOutcome;
use tapbeacon::pipeline::Pipeline;
use protocol::{DeviceMessage, HostCommand, MsgBuffer, VERSION};

// ── BLE GATT server definition ──────────────────────────────────────
//
// Lives in the binary: proc macros depend on trouble-host which is
// firmware-only. comm::ble_uuids holds the same UUIDs as constants.

#[gatt_service(uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e")]
struct UartService {
    /// RX: host commands, write-only.
    /// Companion sends NDJSON commands which are accumulated via LineReader.
    #[characteristic(uuid = "6e400002-b5a3-f393-e0a9-e50e24dcca9e", write)]
    rx: [u8; 20],

    /// TX: events, notify-only.
    /// Messages are chunked into BLE_MAX_NOTIFY-sized pieces.
    /// The companion accumulates until it sees '\n' (NDJSON delimiter).
    #[characteristic(uuid = "6e400003-b5a3-f393-e0a9-e50e24dcca9e", notify)]
    tx: [u8; 20],
}

#[gatt_server]
struct WatchServer {
    uart: UartService,
}

// ── Channel type aliases ──────────────────────────────────────────────

type OutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 8>;
type BleOutputChannel = Channel<CriticalSectionRawMutex, MsgBuffer, 4>;
type CommandChannel = Channel<CriticalSectionRawMutex, HostCommand, 4>;

// ── Static channels and shared state ─────────────────────────────────

/// Serialized output messages
static OUTPUT_CHANNEL: OutputChannel = Channel::new();

/// Host commands from BLE
static CMD_CHANNEL: CommandChannel = Channel::new();

/// BLE output: the serial task clones messages here for notification.
static BLE_OUTPUT_CHANNEL: BleOutputChannel = Channel::new();

/// Runtime tunables, written by the command task, read by the others.
static CONFIG: Mutex<Cell<Config>> = Mutex::new(Cell::new(Config::new()));

/// Decoded cards waiting for the transmitter (latest wins).
static MAILBOX: Mutex<RefCell<CardMailbox>> = Mutex::new(RefCell::new(CardMailbox::new()));

/// Wakes the beacon task when MAILBOX has a card.
static CARD_READY: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Whether the tap detector is sampling (toggled by host Start/Stop commands)
static RUNNING: AtomicBool = AtomicBool::new(true);

/// Set by the command task, consumed by the sampler.
static RESET_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Decoder state name for status reports.
static DECODER_STATE: Mutex<Cell<&'static str>> = Mutex::new(Cell::new("idle"));

/// Number of connected BLE clients
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);

fn get_config() -> Config {
    critical_section::with(|cs| CONFIG.borrow(cs).get())
}

/// Serialize and queue a message; dropped if the channel is full.
fn emit(msg: &DeviceMessage) {
    if let Some(buf) = comm::encode_message(msg) {
        let _ = OUTPUT_CHANNEL.try_send(buf);
    }
}

/// Card observer for the pipeline: post and return.
fn post_card(card: Card) {
    critical_section::with(|cs| {
        MAILBOX.borrow_ref_mut(cs).post(card);
    });
    CARD_READY.signal(());
}

// ── Raw 802.11 TX ─────────────────────────────────────────────────────

// FFI bindings into the WiFi driver linked by esp-radio.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
    fn esp_wifi_get_mac(ifx: u32, mac: *mut u8) -> i32;
    fn esp_wifi_80211_tx(ifx: u32, buffer: *const u8, len: i32, en_sys_seq: bool) -> i32;
}

const WIFI_IF_STA: u32 = 0;
const ESP_OK: i32 = 0;

fn station_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    let err = unsafe { esp_wifi_get_mac(WIFI_IF_STA, mac.as_mut_ptr()) };
    if err != ESP_OK {
        log::warn!("esp_wifi_get_mac failed: {}", err);
    }
    mac
}

/// Wrap `name` in a beacon from `mac` and hand it to the driver.
fn transmit_beacon(name: &[u8], mac: &[u8; 6]) -> Result<(), RadioError> {
    let frame = beacon::build_beacon_frame(name, mac).ok_or(RadioError::InvalidFrame)?;
    let err = unsafe { esp_wifi_80211_tx(WIFI_IF_STA, frame.as_ptr(), frame.len() as i32, true) };
    RadioError::check_tx(err)
}

// ── Entry point ──────────────────────────────────────────────────────

#[esp_rtos::main]
async fn main(spawner: embassy_executor::Spawner) {
    esp_println::logger::init_logger_from_env();

    let peripherals = esp_hal::init(esp_hal::Config::default());

    // BLE + WiFi coex stacks
    esp_alloc::heap_allocator!(size: 128 * 1024);

    // Start the RTOS: requires timer + software interrupt
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let sw_int = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, sw_int.software_interrupt0);

    log::info!("tapbeacon v{} starting on {}", VERSION, board::BOARD_NAME);

    if let Err(e) = get_config().validate() {
        log::error!("Default config invalid: {}", e);
    }

    // ── IMU bus (SDA 18 / SCL 8 on the watch) ──────────────────────────

    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_hz(board::I2C_FREQ_HZ)),
    )
    .expect("I2C init failed")
    .with_sda(peripherals.GPIO18)
    .with_scl(peripherals.GPIO8);

    spawner.spawn(sampler_task(i2c)).unwrap();
    spawner.spawn(output_serial_task()).unwrap();
    spawner.spawn(status_task()).unwrap();
    spawner.spawn(command_task()).unwrap();

    // ── BLE radio initialization ───────────────────────────────────────
    // BLE must be initialized BEFORE WiFi for coexistence to work
    // (especially on ESP32-S3).

    let connector =
        esp_radio::ble::controller::BleConnector::new(peripherals.BT, Default::default())
            .expect("BLE connector init failed");

    log::info!("BLE connector initialized");

    // ── WiFi, station mode, raw TX only ────────────────────────────────

    let (mut wifi_controller, _wifi_interfaces) =
        esp_radio::wifi::new(peripherals.WIFI, Default::default()).expect("WiFi init failed");

    wifi_controller
        .set_config(&esp_radio::wifi::ModeConfig::Client(Default::default()))
        .expect("WiFi mode config failed");
    wifi_controller.start().expect("WiFi start failed");
    let err = unsafe { esp_wifi_set_channel(defaults::BEACON_CHANNEL, 0) };
    if err != ESP_OK {
        log::warn!("esp_wifi_set_channel failed: {}", err);
    }

    let mac = station_mac();
    log::info!(
        "WiFi ready for beacons on channel {} as {:02X?}",
        defaults::BEACON_CHANNEL,
        mac
    );
    spawner.spawn(beacon_task(mac)).unwrap();

    let controller: ExternalController<_, 20> = ExternalController::new(connector);

    static HOST_RESOURCES: StaticCell<HostResources<DefaultPacketPool, 1, 2>> = StaticCell::new();
    let resources = HOST_RESOURCES.init(HostResources::new());

    let address = Address::random([0xff, 0x8f, 0x1a, 0x05, 0xe4, 0xab]);

    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        mut runner,
        ..
    } = stack.build();

    let server = WatchServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
        name: comm::BLE_ADV_NAME,
        appearance: &appearance::UNKNOWN,
    }))
    .expect("GATT server init failed");

    log::info!("BLE radio initialized");

    // ── BLE orchestration ──────────────────────────────────────────────
    //
    //   1. BLE stack runner (drives HCI)
    //   2. GATT server (advertise, accept connections, send notifications)

    let _ = embassy_futures::join::join(
        async {
            loop {
                if let Err(e) = runner.run().await {
                    log::error!("BLE runner error: {:?}", e);
                    Timer::after(Duration::from_secs(1)).await;
                }
            }
        },
        async {
            loop {
                let mut adv_data = [0u8; 31];
                let adv_len = match AdStructure::encode_slice(
                    &[
                        AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                        AdStructure::CompleteLocalName(comm::BLE_ADV_NAME.as_bytes()),
                    ],
                    &mut adv_data[..],
                ) {
                    Ok(len) => len,
                    Err(e) => {
                        log::error!("Ad encode error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let advertiser = match peripheral
                    .advertise(
                        &Default::default(),
                        Advertisement::ConnectableScannableUndirected {
                            adv_data: &adv_data[..adv_len],
                            scan_data: &[],
                        },
                    )
                    .await
                {
                    Ok(adv) => adv,
                    Err(e) => {
                        log::error!("BLE advertise error: {:?}", e);
                        Timer::after(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                log::info!("BLE advertising as '{}'", comm::BLE_ADV_NAME);

                let conn = match advertiser.accept().await {
                    Ok(c) => c,
                    Err(e) => {
                        log::error!("BLE accept error: {:?}", e);
                        continue;
                    }
                };

                let gatt_conn = match conn.with_attribute_server(&server) {
                    Ok(gc) => gc,
                    Err(e) => {
                        log::error!("GATT setup error: {:?}", e);
                        continue;
                    }
                };

                log::info!("BLE client connected");
                BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);

                handle_gatt_connection(&gatt_conn, &server).await;

                BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
                log::info!("BLE client disconnected, re-advertising");
            }
        },
    )
    .await;
}

/// Forward output messages as notifications and turn writes into commands.
async fn handle_gatt_connection<'s, P: PacketPool>(
    conn: &GattConnection<'_, 's, P>,
    server: &'s WatchServer<'_>,
) {
    let ble_rx = BLE_OUTPUT_CHANNEL.receiver();
    let mut line_reader = LineReader::new();

    loop {
        match embassy_futures::select::select(ble_rx.receive(), conn.next()).await {
            embassy_futures::select::Either::First(msg) => {
                // Pad short chunks with newlines so the companion sees
                // empty lines instead of null bytes.
                for chunk in msg.chunks(comm::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    if server.uart.tx.notify(conn, &padded).await.is_err() {
                        return;
                    }
                }
            }
            embassy_futures::select::Either::Second(event) => match event {
                GattConnectionEvent::Disconnected { .. } => return,
                GattConnectionEvent::Gatt { event } => {
                    if let GattEvent::Write(ref write_event) = event {
                        if write_event.handle() == server.uart.rx.handle {
                            for &byte in write_event.data() {
                                if let Some(line) = line_reader.feed(byte) {
                                    if let Some(cmd) = comm::parse_command(line) {
                                        let _ = CMD_CHANNEL.try_send(cmd);
                                    }
                                }
                            }
                        }
                    }
                    // Must accept/reply to all GATT events
                    if let Ok(reply) = event.accept() {
                        reply.send().await;
                    }
                }
                _ => {}
            },
        }
    }
}

/// 50 Hz sampling loop: IMU → detector → decoder → mailbox.
#[embassy_executor::task]
async fn sampler_task(i2c: I2c<'static, Blocking>) {
    let mut imu = Qmi8658::new(i2c);
    while let Err(e) = imu.init() {
        log::error!("QMI8658 init failed: {}, retrying", e);
        Timer::after(Duration::from_secs(1)).await;
    }

    let mut pipeline = Pipeline::new(&get_config());
    let mut ticker = Ticker::every(Duration::from_millis(defaults::SAMPLE_PERIOD_MS));

    log::info!("Sampler task started");

    loop {
        ticker.next().await;

        if RUNNING.load(Ordering::Relaxed) {
            pipeline.start();
        } else {
            pipeline.stop();
        }
        if RESET_REQUESTED.swap(false, Ordering::Relaxed) {
            pipeline.reset();
        }
        pipeline.apply_config(&get_config());

        let now = Instant::now().as_millis();
        let step = pipeline.tick(&mut imu, now, &mut post_card);

        let state = pipeline.decoder_state().as_str();
        critical_section::with(|cs| DECODER_STATE.borrow(cs).set(state));

        let Some(step) = step else { continue };
        emit(&comm::tap_message(&step.tap, now));
        emit(&comm::gesture_message(&step.outcome, now));
        if let FeedOutcome::Completed(card) = step.outcome {
            let label = comm::card_label(&card);
            emit(&comm::card_message(&card, &label, now));
        }
    }
}

/// Drains the card mailbox one burst at a time. A burst in progress always
/// finishes; newer cards wait in the mailbox.
#[embassy_executor::task]
async fn beacon_task(mac: [u8; 6]) {
    log::info!("Beacon task started");

    loop {
        CARD_READY.wait().await;

        while let Some(card) = critical_section::with(|cs| MAILBOX.borrow_ref_mut(cs).take()) {
            let config = get_config().beacon;
            let Some(mut burst) = Burst::new(card, &config) else {
                log::error!("Card {} does not fit an SSID with current prefix", card);
                continue;
            };

            while let Some(name) = burst.next_payload() {
                let result = transmit_beacon(name, &mac);
                burst.record(result);
                if !burst.is_done() {
                    Timer::after(Duration::from_millis(burst.interval_ms())).await;
                }
            }

            let report = burst.report();
            let label = comm::card_label(&report.card);
            emit(&DeviceMessage::Burst {
                card: &label,
                sent: report.sent,
                failed: report.failed,
                ts: comm::timestamp(Instant::now().as_millis()),
            });
        }
    }
}

/// Serial output task: logs each message and forwards a clone to BLE.
#[embassy_executor::task]
async fn output_serial_task() {
    log::info!("Serial output task started");

    let output_rx = OUTPUT_CHANNEL.receiver();

    loop {
        let msg = output_rx.receive().await;

        // Drops if full or no client
        let _ = BLE_OUTPUT_CHANNEL.try_send(msg.clone());

        if let Ok(s) = core::str::from_utf8(&msg) {
            log::info!("{}", s.trim_end());
        }
    }
}

fn status_message() -> DeviceMessage<'static> {
    DeviceMessage::Status {
        running: RUNNING.load(Ordering::Relaxed),
        uptime: (Instant::now().as_millis() / 1000) as u32,
        decoder: critical_section::with(|cs| DECODER_STATE.borrow(cs).get()),
        ble_clients: BLE_CLIENTS.load(Ordering::Relaxed),
        board: board::BOARD_NAME,
        version: VERSION,
    }
}

/// Periodic status reporting task
#[embassy_executor::task]
async fn status_task() {
    loop {
        Timer::after(Duration::from_secs(30)).await;
        emit(&status_message());
    }
}

/// Host command processing task: applies commands to CONFIG and RUNNING
/// and answers queries.
#[embassy_executor::task]
async fn command_task() {
    let cmd_rx = CMD_CHANNEL.receiver();

    loop {
        let cmd = cmd_rx.receive().await;

        let mut config = get_config();
        let mut running = RUNNING.load(Ordering::Relaxed);

        let effect = comm::handle_command(&cmd, &mut config, &mut running);

        critical_section::with(|cs| CONFIG.borrow(cs).set(config));
        RUNNING.store(running, Ordering::Relaxed);

        match effect {
            CommandEffect::SendStatus => emit(&status_message()),
            CommandEffect::SendConfig | CommandEffect::ConfigChanged => {
                emit(&comm::config_message(&config))
            }
            CommandEffect::ResetDecoder => RESET_REQUESTED.store(true, Ordering::Relaxed),
            CommandEffect::None | CommandEffect::Rejected(_) => {}
        }
    }
}
