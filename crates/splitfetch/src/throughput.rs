// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

const UNITS: [&str; 5] = ["bit/s", "kbit/s", "Mbit/s", "Gbit/s", "Tbit/s"];

/// Renders a bit rate with a decimal SI prefix, e.g. `1500.0` as
/// `"1.5 kbit/s"`. Anything at or above 1000 Tbit/s stays in Tbit/s.
#[must_use]
pub fn format_throughput(bits_per_sec: f64) -> String {
    let mut value = bits_per_sec;
    let mut pow = 0;
    while value >= 1000.0 && pow < UNITS.len() - 1 {
        value /= 1000.0;
        pow += 1;
    }
    format!("{value} {}", UNITS[pow])
}
