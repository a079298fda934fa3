//! Audio device enumeration
//!
//! Lists microphones and earpieces across ALL available audio hosts (JACK,
//! ALSA, PulseAudio, CoreAudio, WASAPI...) so a hearing device on a specific
//! host can be picked explicitly.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};

use super::config::DeviceId;
use super::error::{AudioError, AudioResult};

/// Which side of the duplex stream a device serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// Human-readable name for a host ID
fn host_name(host_id: HostId) -> String {
    let name = format!("{:?}", host_id);
    match name.as_str() {
        "Alsa" => "ALSA".to_string(),
        "Jack" => "JACK".to_string(),
        "Wasapi" => "WASAPI".to_string(),
        _ => name,
    }
}

/// Host by its display name
fn host_by_name(name: &str) -> Option<Host> {
    cpal::available_hosts()
        .into_iter()
        .find(|host_id| host_name(*host_id) == name)
        .and_then(|host_id| cpal::host_from_id(host_id).ok())
}

fn devices_of(host: &Host, direction: Direction) -> Option<Vec<cpal::Device>> {
    let devices: Result<Vec<cpal::Device>, _> = match direction {
        Direction::Input => host.input_devices().map(|d| d.collect()),
        Direction::Output => host.output_devices().map(|d| d.collect()),
    };
    match devices {
        Ok(devices) => Some(devices),
        Err(e) => {
            log::debug!("Could not enumerate {} devices: {}", direction.label(), e);
            None
        }
    }
}

fn default_of(host: &Host, direction: Direction) -> Option<cpal::Device> {
    match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    }
}

/// Information about an audio device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Identifier for configuration (includes host info)
    pub id: DeviceId,
    pub name: String,
    /// Host backend name (e.g., "ALSA", "JACK")
    pub host: String,
    pub direction: Direction,
    /// Whether this is the system default device for its host
    pub is_default: bool,
    /// Common sample rates inside the supported ranges
    pub sample_rates: Vec<u32>,
    pub max_channels: u16,
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.host, self.name)?;
        if self.is_default {
            write!(f, " (default)")?;
        }
        Ok(())
    }
}

/// Every device for one direction, default devices first
pub fn get_devices(direction: Direction) -> AudioResult<Vec<AudioDevice>> {
    let mut all_devices: Vec<AudioDevice> = Vec::new();

    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(h) => h,
            Err(e) => {
                log::debug!("Could not initialize host {:?}: {}", host_id, e);
                continue;
            }
        };
        let host_label = host_name(host_id);
        let default_name = default_of(&host, direction).and_then(|d| d.name().ok());

        for device in devices_of(&host, direction).unwrap_or_default() {
            let Ok(name) = device.name() else {
                continue;
            };
            let ranges: Vec<(u16, u32, u32)> = match direction {
                Direction::Input => device.supported_input_configs().map(|configs| {
                    configs
                        .map(|c| (c.channels(), c.min_sample_rate().0, c.max_sample_rate().0))
                        .collect()
                }),
                Direction::Output => device.supported_output_configs().map(|configs| {
                    configs
                        .map(|c| (c.channels(), c.min_sample_rate().0, c.max_sample_rate().0))
                        .collect()
                }),
            }
            .unwrap_or_default();
            if ranges.is_empty() {
                continue;
            }

            let max_channels = ranges.iter().map(|r| r.0).max().unwrap_or(0);
            let mut sample_rates: Vec<u32> = [16000, 22050, 32000, 44100, 48000, 96000]
                .into_iter()
                .filter(|rate| ranges.iter().any(|&(_, min, max)| *rate >= min && *rate <= max))
                .collect();
            sample_rates.dedup();

            all_devices.push(AudioDevice {
                id: DeviceId::with_host(&name, &host_label),
                is_default: default_name.as_ref() == Some(&name),
                name,
                host: host_label.clone(),
                direction,
                sample_rates,
                max_channels,
            });
        }
    }

    if all_devices.is_empty() {
        return Err(AudioError::NoDevices(direction.label()));
    }

    all_devices.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.name.cmp(&b.name))
    });

    log::info!(
        "Enumerated {} {} devices from {} hosts",
        all_devices.len(),
        direction.label(),
        cpal::available_hosts().len()
    );
    Ok(all_devices)
}

/// Find a device by its ID
///
/// Uses the host in the ID when set, otherwise searches every host.
pub fn find_device_by_id(id: &DeviceId, direction: Direction) -> AudioResult<cpal::Device> {
    let matches = |d: &cpal::Device| d.name().ok().as_ref() == Some(&id.name);

    if let Some(host) = id.host.as_deref().and_then(host_by_name) {
        return devices_of(&host, direction)
            .ok_or_else(|| AudioError::ConfigError(format!("cannot list {} devices", direction.label())))?
            .into_iter()
            .find(matches)
            .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()));
    }

    cpal::available_hosts()
        .into_iter()
        .filter_map(|host_id| cpal::host_from_id(host_id).ok())
        .filter_map(|host| devices_of(&host, direction))
        .flatten()
        .find(matches)
        .ok_or_else(|| AudioError::DeviceNotFound(id.display_label()))
}

/// Default device of the default host
pub fn default_device(direction: Direction) -> AudioResult<cpal::Device> {
    default_of(&cpal::default_host(), direction)
        .ok_or_else(|| AudioError::NoDefaultDevice(format!("no default {} device", direction.label())))
}

/// Requested device, or the default one
pub fn resolve_device(id: Option<&DeviceId>, direction: Direction) -> AudioResult<cpal::Device> {
    match id {
        Some(id) => find_device_by_id(id, direction),
        None => default_device(direction),
    }
}
