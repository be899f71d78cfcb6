use asrlink_core::RecognitionError;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};

/// Name that selects the host's default microphone.
pub const DEFAULT_DEVICE: &str = "default";

/// Lookup of capture devices on the default cpal host.
pub struct DeviceManager {
    host: Host,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn inputs(&self) -> Result<impl Iterator<Item = Device>, RecognitionError> {
        self.host.input_devices().map_err(|e| {
            RecognitionError::AudioDevice(format!("cannot enumerate input devices: {e}"))
        })
    }

    /// Names of all input devices, with the default one marked.
    pub fn input_device_names(&self) -> Result<Vec<(String, bool)>, RecognitionError> {
        let default_name = self
            .host
            .default_input_device()
            .and_then(|d| d.name().ok());
        Ok(self
            .inputs()?
            .filter_map(|d| d.name().ok())
            .map(|name| {
                let is_default = default_name.as_deref() == Some(name.as_str());
                (name, is_default)
            })
            .collect())
    }

    pub fn get_input_device(&self, name: &str) -> Result<Device, RecognitionError> {
        if name == DEFAULT_DEVICE {
            return self.host.default_input_device().ok_or_else(|| {
                RecognitionError::AudioDevice("host has no default input device".to_string())
            });
        }
        self.inputs()?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| RecognitionError::AudioDevice(format!("no input device named {name:?}")))
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires audio hardware
    fn test_unknown_device_is_audio_device_error() {
        let result = DeviceManager::new().get_input_device("no-such-microphone-xyz");
        assert!(matches!(result, Err(RecognitionError::AudioDevice(_))));
    }
}
