// PyroVision — ESP WiFi Driver
//
// Non-blocking EspWifi plus raw WIFI_EVENT / IP_EVENT handlers that turn
// driver callbacks into `NetworkEvent`s on the bus.

use core::ffi::c_void;
use std::net::Ipv4Addr;
use std::time::Duration;

use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
};
use esp_idf_sys::{esp_event_base_t, esp_event_handler_instance_t};

use crate::drivers::{ApConfig, StaConfig, WifiDriver, WifiError};
use crate::event_bus::{EventBus, Wait};
use crate::events::{Event, IpInfo, NetworkEvent};
use crate::settings::WifiMode;

use super::esp_check;

const EVENT_POST_WAIT: Wait = Wait::For(Duration::from_millis(100));

pub struct EspWifiDriver {
    wifi: EspWifi<'static>,
    bus: *mut EventBus,
    handlers: Vec<(esp_event_base_t, esp_event_handler_instance_t)>,
    started: bool,
}

// Handler instances and the leaked bus pointer are only touched on
// construction and drop.
unsafe impl Send for EspWifiDriver {}

impl EspWifiDriver {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        bus: EventBus,
    ) -> anyhow::Result<Self> {
        let wifi = EspWifi::new(modem, sysloop, nvs)?;
        let bus = Box::into_raw(Box::new(bus));
        let mut driver = Self {
            wifi,
            bus,
            handlers: Vec::new(),
            started: false,
        };
        unsafe {
            driver.register(esp_idf_sys::WIFI_EVENT)?;
            driver.register(esp_idf_sys::IP_EVENT)?;
        }
        Ok(driver)
    }

    unsafe fn register(&mut self, base: esp_event_base_t) -> anyhow::Result<()> {
        let mut instance: esp_event_handler_instance_t = core::ptr::null_mut();
        esp_check(esp_idf_sys::esp_event_handler_instance_register(
            base,
            esp_idf_sys::ESP_EVENT_ANY_ID,
            Some(on_system_event),
            self.bus.cast(),
            &mut instance,
        ))
        .map_err(|e| anyhow::anyhow!("event handler register failed ({})", e))?;
        self.handlers.push((base, instance));
        Ok(())
    }
}

impl Drop for EspWifiDriver {
    fn drop(&mut self) {
        unsafe {
            for (base, instance) in self.handlers.drain(..) {
                esp_idf_sys::esp_event_handler_instance_unregister(
                    base,
                    esp_idf_sys::ESP_EVENT_ANY_ID,
                    instance,
                );
            }
            drop(Box::from_raw(self.bus));
        }
    }
}

fn client_config(sta: Option<&StaConfig>) -> Result<ClientConfiguration, WifiError> {
    let Some(sta) = sta else {
        return Ok(ClientConfiguration::default());
    };
    Ok(ClientConfiguration {
        ssid: sta
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| WifiError::InvalidConfig(format!("SSID {:?} too long", sta.ssid)))?,
        password: sta
            .password
            .as_str()
            .try_into()
            .map_err(|_| WifiError::InvalidConfig("password too long".into()))?,
        auth_method: if sta.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        ..Default::default()
    })
}

fn ap_config(ap: Option<&ApConfig>) -> Result<AccessPointConfiguration, WifiError> {
    let Some(ap) = ap else {
        return Err(WifiError::InvalidConfig("AP mode without AP settings".into()));
    };
    Ok(AccessPointConfiguration {
        ssid: ap
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| WifiError::InvalidConfig(format!("AP SSID {:?} too long", ap.ssid)))?,
        password: ap
            .password
            .as_str()
            .try_into()
            .map_err(|_| WifiError::InvalidConfig("AP password too long".into()))?,
        auth_method: if ap.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        },
        channel: ap.channel,
        max_connections: ap.max_connections,
        ..Default::default()
    })
}

/// RSSI of the current station association, straight from the driver.
pub fn station_rssi() -> Option<i8> {
    let mut record: esp_idf_sys::wifi_ap_record_t = unsafe { core::mem::zeroed() };
    let ret = unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut record) };
    esp_check(ret).ok().map(|_| record.rssi)
}

fn driver_err(e: esp_idf_sys::EspError) -> WifiError {
    WifiError::Driver(e.to_string())
}

impl WifiDriver for EspWifiDriver {
    fn configure(
        &mut self,
        mode: WifiMode,
        sta: Option<&StaConfig>,
        ap: Option<&ApConfig>,
    ) -> Result<(), WifiError> {
        let config = match mode {
            WifiMode::Sta => Configuration::Client(client_config(sta)?),
            WifiMode::Ap => Configuration::AccessPoint(ap_config(ap)?),
            WifiMode::ApSta => Configuration::Mixed(client_config(sta)?, ap_config(ap)?),
        };
        self.wifi.set_configuration(&config).map_err(driver_err)
    }

    fn start(&mut self) -> Result<(), WifiError> {
        self.wifi.start().map_err(driver_err)?;
        self.started = true;
        Ok(())
    }

    fn connect(&mut self) -> Result<(), WifiError> {
        if !self.started {
            return Err(WifiError::NotStarted);
        }
        self.wifi.connect().map_err(driver_err)
    }

    fn disconnect(&mut self) -> Result<(), WifiError> {
        self.wifi.disconnect().map_err(driver_err)
    }

    fn stop(&mut self) -> Result<(), WifiError> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        self.wifi.stop().map_err(driver_err)
    }

    fn rssi(&mut self) -> Option<i8> {
        if !self.started {
            return None;
        }
        station_rssi()
    }

    fn mac(&mut self) -> [u8; 6] {
        self.wifi.sta_netif().get_mac().unwrap_or_else(|e| {
            log::warn!("Reading station MAC failed: {}", e);
            [0; 6]
        })
    }
}

// ---------------------------------------------------------------------------
// System event translation
// ---------------------------------------------------------------------------

fn ipv4(addr: esp_idf_sys::esp_ip4_addr_t) -> Ipv4Addr {
    Ipv4Addr::from(addr.addr.to_le_bytes())
}

unsafe fn translate(base: esp_event_base_t, id: i32, data: *mut c_void) -> Option<NetworkEvent> {
    let id = id as u32;
    if base == esp_idf_sys::WIFI_EVENT {
        match id {
            esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_CONNECTED => Some(NetworkEvent::WifiConnected),
            esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let info = &*(data as *const esp_idf_sys::wifi_event_sta_disconnected_t);
                Some(NetworkEvent::WifiDisconnected {
                    reason: u16::from(info.reason),
                })
            }
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_START => Some(NetworkEvent::ApStarted),
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_STOP => Some(NetworkEvent::ApStopped),
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_STACONNECTED => Some(NetworkEvent::ApStaConnected),
            esp_idf_sys::wifi_event_t_WIFI_EVENT_AP_STADISCONNECTED => {
                Some(NetworkEvent::ApStaDisconnected)
            }
            _ => None,
        }
    } else if base == esp_idf_sys::IP_EVENT && id == esp_idf_sys::ip_event_t_IP_EVENT_STA_GOT_IP {
        let got = &*(data as *const esp_idf_sys::ip_event_got_ip_t);
        Some(NetworkEvent::WifiGotIp(IpInfo {
            ip: ipv4(got.ip_info.ip),
            netmask: ipv4(got.ip_info.netmask),
            gateway: ipv4(got.ip_info.gw),
        }))
    } else {
        None
    }
}

unsafe extern "C" fn on_system_event(
    arg: *mut c_void,
    base: esp_event_base_t,
    id: i32,
    data: *mut c_void,
) {
    let bus = &*(arg as *const EventBus);
    if let Some(event) = translate(base, id, data) {
        log::debug!("System event -> {:?}", event);
        bus.post_or_warn(&Event::Network(event), EVENT_POST_WAIT);
    }
}
