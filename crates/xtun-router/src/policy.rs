//! Statistics Policy
//!
//! Decides which routed traffic counts toward usage statistics. Blocked
//! traffic never counts; direct traffic is excluded unless enabled.

use crate::rule::RouteAction;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsPolicy {
    pub count_proxy: bool,
    pub count_direct: bool,
}

impl Default for StatsPolicy {
    fn default() -> Self {
        Self {
            count_proxy: true,
            count_direct: false,
        }
    }
}

impl StatsPolicy {
    /// Does traffic routed with `action` count?
    pub fn counts(&self, action: RouteAction) -> bool {
        match action {
            RouteAction::Proxy => self.count_proxy,
            RouteAction::Direct => self.count_direct,
            RouteAction::Block => false,
        }
    }

    /// Counted categories, in compiled order
    pub fn counted(&self) -> Vec<RouteAction> {
        [RouteAction::Direct, RouteAction::Proxy]
            .into_iter()
            .filter(|a| self.counts(*a))
            .collect()
    }

    /// Engine `policy` block enabling per-outbound counters
    pub fn to_xray_policy(&self) -> Value {
        let any = self.count_proxy || self.count_direct;
        json!({
            "system": {
                "statsInboundUplink": false,
                "statsInboundDownlink": false,
                "statsOutboundUplink": any,
                "statsOutboundDownlink": any
            }
        })
    }
}
