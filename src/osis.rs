// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the Renesas RA family standard boot firmware serial
// programming interface (R01AN5372).
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

//! OSIS (ID code protection) inference.
//!
//! The OSIS register itself is not readable over the boot interface;
//! what can be observed is whether the device demanded an ID
//! authentication before accepting commands. OSIS bits [127:126] still
//! decide whether the ALeRASE magic ID works on a locked device.

use crate::Device;

/// Protection mode as far as the host can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsisInference {
    /// No authentication was needed this session; the ID code is the
    /// factory default (all bits set) or protection is off.
    Unlocked,
    /// An ID authentication was performed and accepted, so an ID code
    /// is programmed and protection is active.
    Locked,
}

impl OsisInference {
    pub fn describe(self) -> &'static str {
        match self {
            OsisInference::Unlocked => "Unlocked (no ID authentication required)",
            OsisInference::Locked => "Locked (ID authentication was required and succeeded)",
        }
    }
}

impl<P> Device<P> {
    /// Infer the ID code protection state from this session's history.
    pub fn osis_inference(&self) -> OsisInference {
        if self.authenticated {
            OsisInference::Locked
        } else {
            OsisInference::Unlocked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{rig, MockPort};

    #[test]
    fn test_inference_follows_authentication() {
        let mut device = rig(MockPort::new());
        assert_eq!(device.osis_inference(), OsisInference::Unlocked);

        device.authenticated = true;
        assert_eq!(device.osis_inference(), OsisInference::Locked);
        assert!(device.osis_inference().describe().contains("Locked"));
    }
}
