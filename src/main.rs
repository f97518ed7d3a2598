#[macro_use]
mod logging;

use anyhow::{Context, Result};
use ecowatt_gateway::app::Gateway;
use ecowatt_gateway::config::{self, GatewayConfig, NvsStore};
use ecowatt_gateway::coordinator::{Coordinator, TimerToken};
use ecowatt_gateway::hardware::ModbusSerialPort;
use ecowatt_gateway::ota::EspOtaBackend;
use ecowatt_gateway::registers;
use ecowatt_gateway::transport::EspHttpTransport;
use ecowatt_gateway::utils::{get_embedded_env_value, load_ota_public_key, load_security_state};
use ecowatt_gateway::version;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::prelude::*;
use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration as WifiConfiguration, EspWifi};
use std::time::Duration;

/// Inverter's Modbus slave address (spec §4.2). Fixed for this deployment —
/// unlike `server_url`/`device_id`, it has no remote-config key.
const MODBUS_SLAVE_ID: u8 = 1;

fn connect_wifi(
    modem: esp_idf_hal::modem::Modem,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    ssid: &str,
    password: &str,
) -> Result<BlockingWifi<EspWifi<'static>>> {
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), Some(nvs))?, sysloop)?;

    wifi.set_configuration(&WifiConfiguration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow::anyhow!("ROUTER_SSID too long for wifi config"))?,
        password: password.try_into().map_err(|_| anyhow::anyhow!("ROUTER_PASSWORD too long for wifi config"))?,
        auth_method: AuthMethod::WPA2Personal,
        ..Default::default()
    }))?;

    wifi.start()?;
    wifi.connect()?;
    wifi.wait_netif_up()?;
    Ok(wifi)
}

fn main() -> Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("╔══════════════════════════════════════════════════════╗");
    info!("║  EcoWatt Gateway Firmware                            ║");
    info!("║  Version: {}                                    ║", version::FIRMWARE_VERSION);
    info!("║  Built:   {}                                    ║", version::BUILD_TIMESTAMP);
    info!("╚══════════════════════════════════════════════════════╝");

    let peripherals = Peripherals::take().context("peripherals already taken")?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let gateway_nvs = EspNvs::<NvsDefault>::new(nvs_partition.clone(), "gateway", true).context("opening \"gateway\" nvs namespace")?;
    let mut store = Box::new(NvsStore::new(gateway_nvs));

    // First boot: seed server_url/device_id from the build-time .env so the
    // device can reach the cloud before any config-sync has ever run.
    if store.get_string(config::keys::SERVER_URL).is_none() {
        let mut cfg = GatewayConfig::load(&*store);
        cfg.server_url = get_embedded_env_value("SERVER_URL");
        cfg.device_id = get_embedded_env_value("DEVICE_ID");
        cfg.save(&mut *store)?;
    }

    info!("main: connecting to WiFi...");
    let router_ssid = get_embedded_env_value("ROUTER_SSID");
    let router_password = get_embedded_env_value("ROUTER_PASSWORD");
    let wifi_result = connect_wifi(peripherals.modem, sysloop, nvs_partition, &router_ssid, &router_password);
    let wifi_associated = wifi_result.is_ok();
    match &wifi_result {
        Ok(_) => info!("main: WiFi associated"),
        Err(e) => error!("main: WiFi association failed: {e}"),
    }
    // Keep the driver alive for the process lifetime even if main() never
    // reads it again; dropping it would tear the interface down.
    let _wifi = wifi_result.ok();

    let uart_config = UartConfig::new().baudrate(9600.Hz());
    let uart = UartDriver::new(
        peripherals.uart1,
        peripherals.pins.gpio17,
        peripherals.pins.gpio16,
        Option::<esp_idf_hal::gpio::AnyIOPin>::None,
        Option::<esp_idf_hal::gpio::AnyIOPin>::None,
        &uart_config,
    )
    .context("initializing Modbus UART")?;
    let port = Box::new(ModbusSerialPort::new(uart));

    let transport = Box::new(EspHttpTransport::new().context("initializing HTTP transport")?);
    let ota_backend: Box<dyn ecowatt_gateway::ota::OtaBackend> = Box::new(EspOtaBackend::new().context("initializing OTA backend")?);
    let security = load_security_state();
    let ota_public_key = load_ota_public_key();
    let boot_epoch_ms = registers::now_ms();

    let mut gateway = Gateway::new(store, port, transport, ota_backend, ota_public_key, security, MODBUS_SLAVE_ID, boot_epoch_ms)?;

    let periods = gateway.periods();
    let period_of = |token: TimerToken| periods.iter().find(|(t, _)| *t == token).map(|(_, p)| *p).unwrap_or(0);
    let mut coordinator = Coordinator::new(
        period_of(TimerToken::Poll),
        period_of(TimerToken::CommandPoll),
        period_of(TimerToken::Upload),
        period_of(TimerToken::ConfigSync),
        period_of(TimerToken::FirmwareCheck),
    );

    gateway.run_post_boot_validation(wifi_associated);

    info!("main: entering run loop");
    loop {
        let before = std::time::Instant::now();
        let now_ms = registers::now_ms();
        coordinator.tick(now_ms, &mut gateway, || before.elapsed());

        for (token, period_secs) in gateway.periods() {
            coordinator.set_period(token, period_secs);
        }

        if gateway.reboot_requested() {
            warn!("main: reboot requested, restarting to activate pending firmware");
            std::thread::sleep(Duration::from_millis(200));
            unsafe {
                esp_idf_sys::esp_restart();
            }
        }

        std::thread::sleep(Duration::from_millis(200));
    }
}
