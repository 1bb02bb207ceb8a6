// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Static configuration for the FPM gateway, handed to the dispatcher at
/// start time. The one live-tunable item, `clear_routes`, can be changed
/// afterwards through [`crate::gateway::Gateway::reconfigure`].
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct GatewayConfig {
    /// Address the gateway listens on for FPM sessions.
    pub listen: String,

    /// Withdraw all of a peer's routes when its session ends.
    pub clear_routes: bool,

    /// Seconds of silence after which a keepalive-capable peer is declared
    /// dead.
    pub idle_hold_time: u64,

    /// Timer tick resolution in milliseconds.
    pub resolution: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: format!("[::]:{}", crate::FPM_PORT),
            clear_routes: true,
            idle_hold_time: crate::DEFAULT_IDLE_HOLD_TIME,
            resolution: 100,
        }
    }
}
