// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `system:*` channels: host facts and their persisted overrides.

use std::sync::Arc;

use serde_json::Value;

use freja_config::SystemInfo;

use crate::bus::{LocalBus, Reply};
use crate::Services;

pub async fn register(bus: &Arc<LocalBus>, services: Arc<Services>) {
    let s = Arc::clone(&services);
    bus.register("system:systemInfo", move |_payload| {
        let s = Arc::clone(&s);
        async move {
            let mut info = serde_json::to_value(SystemInfo::gather(&s.paths))
                .unwrap_or_else(|_| Value::Object(Default::default()));
            // Persisted overrides (e.g. a user-chosen work dir) win over
            // gathered defaults.
            if let Ok(Value::Object(overrides)) = s.system_store.read() {
                if let Value::Object(map) = &mut info {
                    for (k, v) in overrides {
                        map.insert(k, v);
                    }
                }
            }
            Reply::ok(info)
        }
    })
    .await;

    let s = Arc::clone(&services);
    bus.register("system:updateSystemInfo", move |payload| {
        let s = Arc::clone(&s);
        async move { Reply::from_result(s.system_store.merge(&payload)) }
    })
    .await;
}
