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

//! Remote Bluetooth peer. Owner of the transports established towards it.

use crate::adapter::{Adapter, Address};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// One remote peer. The `transports` map, keyed by the mediator object path,
/// is the single source of truth for transport reachability: its mutex also
/// guards every transport reference count beneath this device.
pub struct Device {
    adapter: Arc<Adapter>,
    pub address: Address,
    dbus_path: String,
    pub(crate) transports: Mutex<HashMap<String, Arc<Transport>>>,
}

impl Device {
    /// Create a device and attach it to its adapter.
    pub fn new(adapter: &Arc<Adapter>, address: Address) -> Arc<Self> {
        let device = Arc::new(Self {
            adapter: adapter.clone(),
            address,
            dbus_path: format!("{}/dev_{}", adapter.dbus_path(), address.to_path_component()),
            transports: Mutex::new(HashMap::new()),
        });
        adapter.device_insert(&device);
        device
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn dbus_path(&self) -> &str {
        &self.dbus_path
    }

    /// Look up a transport by its mediator object path. On success the
    /// transport reference count has already been incremented on behalf of
    /// the caller, who is expected to `unref` it eventually.
    pub fn transport_lookup(&self, dbus_path: &str) -> Option<Arc<Transport>> {
        let transports = self.transports.lock().unwrap();
        transports.get(dbus_path).map(|t| {
            t.ref_count_raw().fetch_add(1, Ordering::SeqCst);
            t.clone()
        })
    }
}
