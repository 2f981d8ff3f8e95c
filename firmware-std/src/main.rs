//! tapbeacon ESP-IDF std firmware
//!
//! Thread-based implementation using FreeRTOS threads, std::sync::mpsc
//! channels and a Mutex/Condvar card mailbox. Feature-equivalent to the
//! no_std Embassy firmware but uses ESP-IDF services (NimBLE via
//! esp32-nimble, I2C and WiFi via esp-idf-svc).

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tapbeacon::{beacon, board, comm, defaults, protocol};

use beacon::{Burst, CardMailbox, RadioError};
use comm::{CommandEffect, LineReader};
use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver};
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::hal::units::Hertz;
use esp_idf_svc::sys::{
    esp_wifi_80211_tx, esp_wifi_set_channel, wifi_interface_t_WIFI_IF_STA,
    wifi_second_chan_t_WIFI_SECOND_CHAN_NONE,
};
use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use protocol::{DeviceMessage, HostCommand, MsgBuffer, VERSION};
use tapbeacon::accel::Qmi8658;
use tapbeacon::card::Card;
use tapbeacon::config::Config;
use tapbeacon::decoder::FeedOutcome;
use tapbeacon::pipeline::Pipeline;

use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{BLEAdvertisementData, BLEDevice, NimbleProperties};

// ── Shared state (same roles as the no_std statics) ──────────────────

static RUNNING: AtomicBool = AtomicBool::new(true);
static RESET_REQUESTED: AtomicBool = AtomicBool::new(false);
static BLE_CLIENTS: AtomicU8 = AtomicU8::new(0);
static CONFIG: Mutex<Config> = Mutex::new(Config::new());
static DECODER_STATE: Mutex<&'static str> = Mutex::new("idle");

/// Decoded cards waiting for the beacon thread (latest wins).
static MAILBOX: Mutex<CardMailbox> = Mutex::new(CardMailbox::new());
static CARD_READY: Condvar = Condvar::new();

/// Boot time, captured once in main, used for uptime calculation.
static BOOT_INSTANT: Mutex<Option<Instant>> = Mutex::new(None);

fn uptime_secs() -> u32 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_secs() as u32))
        .unwrap_or(0)
}

fn uptime_millis() -> u64 {
    BOOT_INSTANT
        .lock()
        .ok()
        .and_then(|i| i.map(|boot| boot.elapsed().as_millis() as u64))
        .unwrap_or(0)
}

fn get_config() -> Config {
    *CONFIG.lock().unwrap()
}

fn emit(output_tx: &SyncSender<MsgBuffer>, msg: &DeviceMessage) {
    if let Some(buf) = comm::encode_message(msg) {
        let _ = output_tx.try_send(buf);
    }
}

/// Card observer for the pipeline: post and return.
fn post_card(card: Card) {
    MAILBOX.lock().unwrap().post(card);
    CARD_READY.notify_one();
}

fn main() -> anyhow::Result<()> {
    // Bind the ESP-IDF logger to the `log` facade
    esp_idf_svc::log::EspLogger::initialize_default();

    *BOOT_INSTANT.lock().unwrap() = Some(Instant::now());

    log::info!("tapbeacon v{} starting on {} (std)", VERSION, board::BOARD_NAME);

    if let Err(e) = get_config().validate() {
        anyhow::bail!("default config invalid: {e}");
    }

    // ── Peripherals ──────────────────────────────────────────────────

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // ── Channels ─────────────────────────────────────────────────────

    let (output_tx, output_rx) = mpsc::sync_channel::<MsgBuffer>(8);
    let (ble_output_tx, ble_output_rx) = mpsc::sync_channel::<MsgBuffer>(4);
    let (cmd_tx, cmd_rx) = mpsc::sync_channel::<HostCommand>(4);

    // ── WiFi, station mode, raw TX only ──────────────────────────────

    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
        sys_loop,
    )?;
    wifi.set_configuration(&esp_idf_svc::wifi::Configuration::Client(Default::default()))?;
    wifi.start()?;
    unsafe {
        esp_idf_svc::sys::esp!(esp_wifi_set_channel(
            defaults::BEACON_CHANNEL,
            wifi_second_chan_t_WIFI_SECOND_CHAN_NONE
        ))?;
    }
    let mac = wifi.wifi().sta_netif().get_mac()?;
    log::info!(
        "WiFi ready for beacons on channel {} as {:02X?}",
        defaults::BEACON_CHANNEL,
        mac
    );

    // ── Sampler thread ───────────────────────────────────────────────

    let i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio18,
        peripherals.pins.gpio8,
        &I2cConfig::new().baudrate(Hertz(board::I2C_FREQ_HZ)),
    )?;
    let sampler_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("sampler".into())
        .stack_size(4096)
        .spawn(move || {
            sampler_thread(i2c, sampler_output_tx);
        })?;
    log::info!("Sampler thread spawned");

    // ── Beacon thread ────────────────────────────────────────────────

    let beacon_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("beacon".into())
        .stack_size(4096)
        .spawn(move || {
            beacon_thread(mac, beacon_output_tx);
        })?;
    log::info!("Beacon thread spawned");

    // ── Output thread ────────────────────────────────────────────────

    thread::Builder::new()
        .name("output".into())
        .stack_size(4096)
        .spawn(move || {
            output_thread(output_rx, ble_output_tx);
        })?;
    log::info!("Output thread spawned");

    // ── Command threads ──────────────────────────────────────────────

    let cmd_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("command".into())
        .stack_size(4096)
        .spawn(move || {
            command_thread(cmd_rx, cmd_output_tx);
        })?;
    log::info!("Command thread spawned");

    let serial_cmd_tx = cmd_tx.clone();
    thread::Builder::new()
        .name("serial_in".into())
        .stack_size(4096)
        .spawn(move || {
            serial_input_thread(serial_cmd_tx);
        })?;
    log::info!("Serial input thread spawned");

    // ── Status thread ────────────────────────────────────────────────

    let status_output_tx = output_tx.clone();
    thread::Builder::new()
        .name("status".into())
        .stack_size(4096)
        .spawn(move || {
            status_thread(status_output_tx);
        })?;
    log::info!("Status thread spawned");

    // ── BLE (NimBLE) runs on main thread ─────────────────────────────

    // `wifi` must stay alive for raw TX
    let _wifi = wifi;
    ble_main(cmd_tx, ble_output_rx);
}

// ── Sampler thread ───────────────────────────────────────────────────

fn sampler_thread(i2c: I2cDriver<'static>, output_tx: SyncSender<MsgBuffer>) {
    let mut imu = Qmi8658::new(i2c);
    while let Err(e) = imu.init() {
        log::error!("QMI8658 init failed: {}, retrying", e);
        thread::sleep(Duration::from_secs(1));
    }

    let mut pipeline = Pipeline::new(&get_config());
    let period = Duration::from_millis(defaults::SAMPLE_PERIOD_MS);
    let mut next_tick = Instant::now();

    log::info!("Sampler thread started");

    loop {
        next_tick += period;
        thread::sleep(next_tick.saturating_duration_since(Instant::now()));

        if RUNNING.load(Ordering::Relaxed) {
            pipeline.start();
        } else {
            pipeline.stop();
        }
        if RESET_REQUESTED.swap(false, Ordering::Relaxed) {
            pipeline.reset();
        }
        pipeline.apply_config(&get_config());

        let now = uptime_millis();
        let step = pipeline.tick(&mut imu, now, &mut post_card);

        *DECODER_STATE.lock().unwrap() = pipeline.decoder_state().as_str();

        let Some(step) = step else { continue };
        emit(&output_tx, &comm::tap_message(&step.tap, now));
        emit(&output_tx, &comm::gesture_message(&step.outcome, now));
        if let FeedOutcome::Completed(card) = step.outcome {
            let label = comm::card_label(&card);
            emit(&output_tx, &comm::card_message(&card, &label, now));
        }
    }
}

// ── Beacon thread ────────────────────────────────────────────────────

/// Wrap `name` in a beacon from `mac` and hand it to the driver.
fn transmit_beacon(name: &[u8], mac: &[u8; 6]) -> Result<(), RadioError> {
    let frame = beacon::build_beacon_frame(name, mac).ok_or(RadioError::InvalidFrame)?;
    let err = unsafe {
        esp_wifi_80211_tx(
            wifi_interface_t_WIFI_IF_STA,
            frame.as_ptr() as *const std::ffi::c_void,
            frame.len() as i32,
            true,
        )
    };
    RadioError::check_tx(err)
}

/// Waits for the mailbox, runs one burst per card. A running burst always
/// finishes; newer cards wait in the mailbox.
fn beacon_thread(mac: [u8; 6], output_tx: SyncSender<MsgBuffer>) {
    log::info!("Beacon thread started");

    loop {
        let card = {
            let mut mailbox = MAILBOX.lock().unwrap();
            loop {
                if let Some(card) = mailbox.take() {
                    break card;
                }
                mailbox = CARD_READY.wait(mailbox).unwrap();
            }
        };

        let config = get_config().beacon;
        let Some(burst) = Burst::new(card, &config) else {
            log::error!("Card {} does not fit an SSID with current prefix", card);
            continue;
        };

        let mut sink = |name: &[u8]| transmit_beacon(name, &mac);
        let report = beacon::run_burst(&mut sink, burst, |ms| {
            thread::sleep(Duration::from_millis(ms))
        });

        let label = comm::card_label(&report.card);
        emit(
            &output_tx,
            &DeviceMessage::Burst {
                card: &label,
                sent: report.sent,
                failed: report.failed,
                ts: comm::timestamp(uptime_millis()),
            },
        );
    }
}

// ── Output thread ────────────────────────────────────────────────────

fn output_thread(output_rx: mpsc::Receiver<MsgBuffer>, ble_output_tx: SyncSender<MsgBuffer>) {
    log::info!("Output thread started");

    while let Ok(msg) = output_rx.recv() {
        let _ = ble_output_tx.try_send(msg.clone());

        if let Ok(s) = std::str::from_utf8(&msg) {
            log::info!("{}", s.trim_end());
        }
    }
}

// ── Status thread ────────────────────────────────────────────────────

fn status_message() -> DeviceMessage<'static> {
    DeviceMessage::Status {
        running: RUNNING.load(Ordering::Relaxed),
        uptime: uptime_secs(),
        decoder: *DECODER_STATE.lock().unwrap(),
        ble_clients: BLE_CLIENTS.load(Ordering::Relaxed),
        board: board::BOARD_NAME,
        version: VERSION,
    }
}

fn status_thread(output_tx: SyncSender<MsgBuffer>) {
    loop {
        thread::sleep(Duration::from_secs(30));
        emit(&output_tx, &status_message());
    }
}

// ── Command threads ──────────────────────────────────────────────────

fn command_thread(cmd_rx: mpsc::Receiver<HostCommand>, output_tx: SyncSender<MsgBuffer>) {
    while let Ok(cmd) = cmd_rx.recv() {
        let mut config = get_config();
        let mut running = RUNNING.load(Ordering::Relaxed);

        let effect = comm::handle_command(&cmd, &mut config, &mut running);

        *CONFIG.lock().unwrap() = config;
        RUNNING.store(running, Ordering::Relaxed);

        match effect {
            CommandEffect::SendStatus => emit(&output_tx, &status_message()),
            CommandEffect::SendConfig | CommandEffect::ConfigChanged => {
                emit(&output_tx, &comm::config_message(&config))
            }
            CommandEffect::ResetDecoder => RESET_REQUESTED.store(true, Ordering::Relaxed),
            CommandEffect::None | CommandEffect::Rejected(_) => {}
        }
    }
}

/// NDJSON commands typed on the USB serial console.
fn serial_input_thread(cmd_tx: SyncSender<HostCommand>) {
    let mut reader = LineReader::new();
    for byte in std::io::stdin().lock().bytes() {
        let Ok(byte) = byte else {
            thread::sleep(Duration::from_millis(50));
            continue;
        };
        if let Some(line) = reader.feed(byte) {
            if let Some(cmd) = comm::parse_command(line) {
                let _ = cmd_tx.try_send(cmd);
            }
        }
    }
}

// ── BLE (NimBLE) main loop ───────────────────────────────────────────

fn ble_main(cmd_tx: SyncSender<HostCommand>, ble_output_rx: mpsc::Receiver<MsgBuffer>) -> ! {
    let ble_device = BLEDevice::take();
    let server = ble_device.get_server();

    // NimBLE auto-restarts advertising on disconnect
    server.on_connect(|_server, desc| {
        log::info!("BLE client connected: {}", desc.address());
        BLE_CLIENTS.fetch_add(1, Ordering::Relaxed);
    });
    server.on_disconnect(|desc, _reason| {
        log::info!("BLE client disconnected: {}", desc.address());
        BLE_CLIENTS.fetch_sub(1, Ordering::Relaxed);
    });

    // Same UUIDs as the no_std GATT server
    let service_uuid = BleUuid::from_uuid128_string(comm::ble_uuids::SERVICE)
        .expect("invalid service UUID");
    let tx_uuid = BleUuid::from_uuid128_string(comm::ble_uuids::TX_CHAR)
        .expect("invalid TX UUID");
    let rx_uuid = BleUuid::from_uuid128_string(comm::ble_uuids::RX_CHAR)
        .expect("invalid RX UUID");

    let service = server.create_service(service_uuid);

    let tx_char = service.lock().create_characteristic(tx_uuid, NimbleProperties::NOTIFY);

    let rx_char = service.lock().create_characteristic(rx_uuid, NimbleProperties::WRITE);

    rx_char.lock().on_write(move |args| {
        thread_local! {
            static LINE_READER: std::cell::RefCell<LineReader> =
                std::cell::RefCell::new(LineReader::new());
        }
        LINE_READER.with(|lr| {
            let mut lr = lr.borrow_mut();
            for &byte in args.recv_data() {
                if let Some(line) = lr.feed(byte) {
                    if let Some(cmd) = comm::parse_command(line) {
                        let _ = cmd_tx.try_send(cmd);
                    }
                }
            }
        });
    });

    let mut adv_data = BLEAdvertisementData::new();
    adv_data.name(comm::BLE_ADV_NAME).add_service_uuid(service_uuid);
    ble_device
        .get_advertising()
        .lock()
        .set_data(&mut adv_data)
        .expect("BLE advertising data failed");
    ble_device
        .get_advertising()
        .lock()
        .start()
        .expect("BLE advertising start failed");
    log::info!("BLE advertising as '{}'", comm::BLE_ADV_NAME);

    // TX notify loop: read from ble_output_rx, notify connected clients
    loop {
        match ble_output_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(msg) => {
                if BLE_CLIENTS.load(Ordering::Relaxed) == 0 {
                    continue;
                }
                for chunk in msg.chunks(comm::BLE_MAX_NOTIFY) {
                    let mut padded = [b'\n'; 20];
                    padded[..chunk.len()].copy_from_slice(chunk);
                    tx_char.lock().set_value(&padded).notify();
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    unreachable!("BLE output channel disconnected");
}
