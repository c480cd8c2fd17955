// Copyright 2025, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local Bluetooth controller, the root of the transport ownership tree.

use crate::device::Device;
use crate::Context;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Bluetooth device address (`BD_ADDR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Render the address the way it is embedded in mediator object paths,
    /// e.g. `12_34_56_78_9A_BC`.
    pub fn to_path_component(self) -> String {
        self.to_string().replace(':', "_")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d, e, g)
    }
}

/// One local Bluetooth controller. Owns the remote devices seen through it;
/// everything below (transports, PCM endpoints) hangs off those devices.
pub struct Adapter {
    ctx: Arc<Context>,
    /// Kernel HCI device index.
    pub dev_id: u16,
    pub address: Address,
    /// Whether the controller supports eSCO links; without it voice
    /// transports are limited to CVSD.
    pub esco_supported: bool,
    dbus_path: String,
    devices: Mutex<HashMap<Address, Arc<Device>>>,
}

impl Adapter {
    pub fn new(ctx: Arc<Context>, dev_id: u16, address: Address, esco_supported: bool) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            dev_id,
            address,
            esco_supported,
            dbus_path: format!("/org/bluez/hci{}", dev_id),
            devices: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn dbus_path(&self) -> &str {
        &self.dbus_path
    }

    pub fn device_lookup(&self, address: Address) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(&address).cloned()
    }

    pub(crate) fn device_insert(&self, device: &Arc<Device>) {
        self.devices.lock().unwrap().insert(device.address, device.clone());
    }

    pub fn device_remove(&self, address: Address) {
        self.devices.lock().unwrap().remove(&address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_formatting() {
        let addr = Address::new([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);
        assert_eq!(addr.to_string(), "12:34:56:78:9A:BC");
        assert_eq!(addr.to_path_component(), "12_34_56_78_9A_BC");
    }
}
