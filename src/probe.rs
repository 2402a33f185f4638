// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! ProbePolicy - deliberately leaks a slice of fused traffic through so
//! the latency signal stays alive.

use rand::Rng;

/// Stateless predicate deciding whether one fused request should be let
/// through as a probe (§4.2).
pub struct ProbePolicy;

impl ProbePolicy {
    /// Returns `true` ("let this one through as a probe") unless one of
    /// the two enforcement conditions holds:
    ///
    /// - enough outbound traffic is already escaping to serve as a probe
    ///   (`outbound_rate >= 10` and the outbound share already exceeds
    ///   `probe_percentage`), or
    /// - the randomized majority draw says "enforce" (`inbound_rate >=
    ///   10` and a uniform `[0, 100)` draw is `>= probe_percentage`).
    ///
    /// The two `>= 10` guards suppress both conditions at rates too low
    /// for the underlying ratios to be meaningful; without the
    /// `inbound_rate >= 10` guard a random draw could otherwise be
    /// interpreted as always-zero at near-zero rates.
    pub fn is_probe(outbound_rate: f64, inbound_rate: f64, probe_percentage: u8) -> bool {
        if outbound_rate >= 10.0 {
            let outbound_share = 100.0 * outbound_rate / inbound_rate;
            if outbound_share > probe_percentage as f64 {
                return false;
            }
        }
        if inbound_rate >= 10.0 {
            let roll = rand::thread_rng().gen_range(0..100);
            if roll >= probe_percentage {
                return false;
            }
        }
        true
    }
}
