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

//! Device Lifecycle Management: state query, unauthenticated
//! transitions, HMAC-SHA256 authenticated regressions, factory
//! initialize and device parameters.

use std::{
    fmt,
    str::FromStr,
    time::Duration,
};

use hmac::{Hmac, Mac};
use serial::SerialPort;
use sha2::Sha256;

use crate::constants::{
    AUTH_FIXED_LEN, CHALLENGE_LEN, DLM_CMD, DLM_KEY_LEN, DLM_TRANSIT_CMD, IDA_CMD, ID_CODE_LEN,
    INI_CMD, PARAM_ID_INIT, PARAM_INIT_DISABLED, PARAM_INIT_ENABLED, PRM_CMD, PRM_SET_CMD,
};
use crate::error::{Error, FrameError, Result};
use crate::{Device, QUERY_TIMEOUT};

const TRANSIT_TIMEOUT: Duration = Duration::from_secs(5);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// RMA transitions erase flash on the device side.
const AUTH_RMA_TIMEOUT: Duration = Duration::from_secs(30);
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);
const PARAM_SET_TIMEOUT: Duration = Duration::from_secs(5);

/// Device lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlmState {
    /// Chip Manufacturing.
    Cm,
    /// Secure Software Development.
    Ssd,
    /// Non-Secure Software Development.
    Nsecsd,
    /// Deployed.
    Dpl,
    /// Locked Debug.
    LckDbg,
    /// Locked Boot Interface.
    LckBoot,
    /// Return Material Authorization requested.
    RmaReq,
    /// Return Material Authorization acknowledged.
    RmaAck,
}

impl DlmState {
    pub fn from_code(code: u8) -> Option<DlmState> {
        match code {
            0x01 => Some(DlmState::Cm),
            0x02 => Some(DlmState::Ssd),
            0x03 => Some(DlmState::Nsecsd),
            0x04 => Some(DlmState::Dpl),
            0x05 => Some(DlmState::LckDbg),
            0x06 => Some(DlmState::LckBoot),
            0x07 => Some(DlmState::RmaReq),
            0x08 => Some(DlmState::RmaAck),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DlmState::Cm => 0x01,
            DlmState::Ssd => 0x02,
            DlmState::Nsecsd => 0x03,
            DlmState::Dpl => 0x04,
            DlmState::LckDbg => 0x05,
            DlmState::LckBoot => 0x06,
            DlmState::RmaReq => 0x07,
            DlmState::RmaAck => 0x08,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DlmState::Cm => "CM",
            DlmState::Ssd => "SSD",
            DlmState::Nsecsd => "NSECSD",
            DlmState::Dpl => "DPL",
            DlmState::LckDbg => "LCK_DBG",
            DlmState::LckBoot => "LCK_BOOT",
            DlmState::RmaReq => "RMA_REQ",
            DlmState::RmaAck => "RMA_ACK",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            DlmState::Cm => "Chip Manufacturing",
            DlmState::Ssd => "Secure Software Development",
            DlmState::Nsecsd => "Non-Secure Software Development",
            DlmState::Dpl => "Deployed",
            DlmState::LckDbg => "Locked Debug",
            DlmState::LckBoot => "Locked Boot Interface",
            DlmState::RmaReq => "Return Material Authorization Request",
            DlmState::RmaAck => "Return Material Authorization Acknowledged",
        }
    }

    /// Whether `self -> dest` is a device-permitted transition without
    /// authentication.
    pub fn can_transit_to(self, dest: DlmState) -> bool {
        matches!(
            (self, dest),
            (DlmState::Cm, DlmState::Ssd)
                | (DlmState::Ssd, DlmState::Nsecsd)
                | (DlmState::Ssd, DlmState::Dpl)
                | (DlmState::Nsecsd, DlmState::Dpl)
                | (DlmState::Dpl, DlmState::LckDbg)
                | (DlmState::Dpl, DlmState::LckBoot)
                | (DlmState::LckDbg, DlmState::LckBoot)
        )
    }

    /// Whether `self -> dest` is a valid authenticated regression.
    /// `NSECSD -> SSD` takes the SECDBG key, `DPL -> NSECSD` the
    /// NONSECDBG key, and `{SSD, DPL} -> RMA_REQ` the RMA key.
    pub fn can_regress_to(self, dest: DlmState) -> bool {
        matches!(
            (self, dest),
            (DlmState::Nsecsd, DlmState::Ssd)
                | (DlmState::Dpl, DlmState::Nsecsd)
                | (DlmState::Ssd, DlmState::RmaReq)
                | (DlmState::Dpl, DlmState::RmaReq)
        )
    }
}

impl fmt::Display for DlmState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.name())
    }
}

#[derive(Debug)]
pub struct ParseDlmStateError;

impl fmt::Display for ParseDlmStateError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "invalid value, state must be one of: `ssd`, `nsecsd`, `dpl`, `lck_dbg`, `lck_boot` or `rma_req`"
        )
    }
}

impl std::error::Error for ParseDlmStateError {}

impl FromStr for DlmState {
    type Err = ParseDlmStateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cm" => Ok(DlmState::Cm),
            "ssd" => Ok(DlmState::Ssd),
            "nsecsd" => Ok(DlmState::Nsecsd),
            "dpl" => Ok(DlmState::Dpl),
            "lck_dbg" => Ok(DlmState::LckDbg),
            "lck_boot" => Ok(DlmState::LckBoot),
            "rma_req" => Ok(DlmState::RmaReq),
            "rma_ack" => Ok(DlmState::RmaAck),
            _ => Err(ParseDlmStateError),
        }
    }
}

impl<P> Device<P>
where
    P: SerialPort,
{
    /// Query the current lifecycle state.
    pub fn dlm_state(&mut self) -> Result<DlmState> {
        let payload = self.transact(DLM_CMD, &[], QUERY_TIMEOUT, "DLM state")?;
        let code = *payload.first().ok_or(Error::Frame(FrameError::Truncated {
            announced: 1,
            available: 0,
        }))?;

        DlmState::from_code(code).ok_or_else(|| {
            Error::Precondition(format!("device reported unknown DLM state 0x{:02X}", code))
        })
    }

    /// Transition the lifecycle state without authentication. The
    /// transition is validated host-side against the device rules
    /// before anything goes on the wire.
    ///
    /// Returns the state the device was in before the transition.
    ///
    /// A transition to `LCK_BOOT` leaves the boot interface
    /// unresponsive; silence after that request is treated as success.
    pub fn dlm_transit(&mut self, dest: DlmState) -> Result<DlmState> {
        let current = self.dlm_state()?;
        if current == dest {
            log::debug!("already in DLM state {}", dest);
            return Ok(current);
        }

        if !current.can_transit_to(dest) {
            return Err(Error::Precondition(format!(
                "DLM transition {} -> {} requires authentication or is not permitted",
                current, dest
            )));
        }

        let payload = [current.code(), dest.code()];
        match self.transact(DLM_TRANSIT_CMD, &payload, TRANSIT_TIMEOUT, "DLM transit") {
            Ok(_) => Ok(current),
            // The bootloader hangs by design after entering LCK_BOOT.
            Err(Error::Timeout(_)) if dest == DlmState::LckBoot => Ok(current),
            Err(err) => Err(err),
        }
    }

    /// Authenticated lifecycle regression.
    ///
    /// The device answers the request with a 16-byte challenge; the
    /// host replies with `HMAC-SHA256(key, challenge || 32 * 0x00)` in
    /// a continuation frame that carries the device-to-host SOD byte (a
    /// quirk of the boot firmware). `unique_id_challenge` asks the
    /// device to use its unique ID as the challenge (CHCT = 0x01),
    /// which is only valid for `RMA_REQ`.
    ///
    /// Returns the state the device regressed from.
    pub fn dlm_authenticate(
        &mut self,
        dest: DlmState,
        key: &[u8],
        unique_id_challenge: bool,
    ) -> Result<DlmState> {
        if key.len() != DLM_KEY_LEN {
            return Err(Error::Precondition(format!(
                "DLM key must be {} bytes, got {}",
                DLM_KEY_LEN,
                key.len()
            )));
        }

        if let Some(sig) = self.signature.as_ref() {
            if sig.group.uses_cmac() {
                return Err(Error::Precondition(
                    "GrpC devices authenticate with AES-128-CMAC, which is not implemented"
                        .into(),
                ));
            }
        }

        if unique_id_challenge && dest != DlmState::RmaReq {
            return Err(Error::Precondition(
                "unique-ID challenge is only valid for RMA_REQ".into(),
            ));
        }

        let current = self.dlm_state()?;
        if !current.can_regress_to(dest) {
            return Err(Error::Precondition(format!(
                "no authenticated regression from {} to {}",
                current, dest
            )));
        }

        let chct = if unique_id_challenge { 0x01 } else { 0x00 };
        let request = [current.code(), dest.code(), chct];
        let challenge = self.transact(IDA_CMD, &request, AUTH_TIMEOUT, "DLM challenge")?;
        if challenge.len() < CHALLENGE_LEN {
            return Err(Error::Frame(FrameError::Truncated {
                announced: CHALLENGE_LEN,
                available: challenge.len(),
            }));
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|_| Error::Precondition("invalid HMAC key".into()))?;
        mac.update(&challenge[..CHALLENGE_LEN]);
        mac.update(&[0u8; AUTH_FIXED_LEN]);
        let response = mac.finalize().into_bytes();

        let timeout = if dest == DlmState::RmaReq {
            AUTH_RMA_TIMEOUT
        } else {
            AUTH_TIMEOUT
        };
        self.transact_ack(IDA_CMD, &response, timeout, "DLM authentication")?;

        log::debug!("DLM regression {} -> {} authenticated", current, dest);
        Ok(current)
    }

    /// ID code authentication (16-byte OSIS ID, or the ALeRASE magic).
    pub fn authenticate_id(&mut self, id_code: &[u8; ID_CODE_LEN]) -> Result<()> {
        self.transact(IDA_CMD, id_code, QUERY_TIMEOUT, "ID authentication")?;
        self.authenticated = true;
        log::debug!("ID authentication successful");
        Ok(())
    }

    /// Factory reset: clears user, data and config areas, boundary
    /// settings and key index, and lands in SSD. Only callable from
    /// SSD, NSECSD or DPL.
    ///
    /// Returns the state the device was in before the reset.
    pub fn initialize(&mut self) -> Result<DlmState> {
        let current = self.dlm_state()?;
        match current {
            DlmState::Ssd | DlmState::Nsecsd | DlmState::Dpl => {}
            _ => {
                return Err(Error::Precondition(format!(
                    "initialize requires SSD, NSECSD or DPL state (device is in {})",
                    current
                )))
            }
        }

        let payload = [current.code(), DlmState::Ssd.code()];
        self.transact(INI_CMD, &payload, INITIALIZE_TIMEOUT, "initialize")?;
        Ok(current)
    }

    /// Read a 1-byte device parameter.
    pub fn param(&mut self, param_id: u8) -> Result<u8> {
        let payload = self.transact(PRM_CMD, &[param_id], QUERY_TIMEOUT, "parameter")?;
        payload.first().copied().ok_or(Error::Frame(FrameError::Truncated {
            announced: 1,
            available: 0,
        }))
    }

    /// Write a 1-byte device parameter. The only documented parameter
    /// is the initialize-command enable, which accepts exactly
    /// `DISABLED` (0x00) or `ENABLED` (0x07).
    pub fn set_param(&mut self, param_id: u8, value: u8) -> Result<()> {
        if param_id == PARAM_ID_INIT
            && value != PARAM_INIT_DISABLED
            && value != PARAM_INIT_ENABLED
        {
            return Err(Error::Precondition(format!(
                "invalid value 0x{:02X} for the initialization parameter (use 0x00 or 0x07)",
                value
            )));
        }

        self.transact(
            PRM_SET_CMD,
            &[param_id, value],
            PARAM_SET_TIMEOUT,
            "parameter setting",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;
    use crate::testutil::{data_response, ok_response, rig, rig_with_map, ra4m2_areas, MockPort};

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_state_codes_and_names() {
        assert_eq!(DlmState::from_code(0x01), Some(DlmState::Cm));
        assert_eq!(DlmState::from_code(0x08), Some(DlmState::RmaAck));
        assert_eq!(DlmState::from_code(0x00), None);
        assert_eq!(DlmState::from_code(0x09), None);

        for code in 1..=8u8 {
            let state = DlmState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }

        assert_eq!(DlmState::LckBoot.name(), "LCK_BOOT");
        assert_eq!("nsecsd".parse::<DlmState>().unwrap(), DlmState::Nsecsd);
        assert_eq!("LCK_DBG".parse::<DlmState>().unwrap(), DlmState::LckDbg);
        assert!("bogus".parse::<DlmState>().is_err());
    }

    #[test]
    fn test_transition_rules() {
        assert!(DlmState::Cm.can_transit_to(DlmState::Ssd));
        assert!(DlmState::Ssd.can_transit_to(DlmState::Nsecsd));
        assert!(DlmState::Ssd.can_transit_to(DlmState::Dpl));
        assert!(DlmState::Nsecsd.can_transit_to(DlmState::Dpl));
        assert!(DlmState::Dpl.can_transit_to(DlmState::LckDbg));
        assert!(DlmState::Dpl.can_transit_to(DlmState::LckBoot));
        assert!(DlmState::LckDbg.can_transit_to(DlmState::LckBoot));

        assert!(!DlmState::Ssd.can_transit_to(DlmState::RmaReq));
        assert!(!DlmState::Nsecsd.can_transit_to(DlmState::Ssd));
        assert!(!DlmState::Cm.can_transit_to(DlmState::Dpl));

        assert!(DlmState::Nsecsd.can_regress_to(DlmState::Ssd));
        assert!(DlmState::Dpl.can_regress_to(DlmState::Nsecsd));
        assert!(DlmState::Ssd.can_regress_to(DlmState::RmaReq));
        assert!(DlmState::Dpl.can_regress_to(DlmState::RmaReq));
        assert!(!DlmState::Nsecsd.can_regress_to(DlmState::RmaReq));
        assert!(!DlmState::Ssd.can_regress_to(DlmState::Nsecsd));
    }

    #[test]
    fn test_dlm_state_query() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x02]));
        let mut device = rig(port);
        assert_eq!(device.dlm_state().unwrap(), DlmState::Ssd);
    }

    #[test]
    fn test_dlm_transit() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x03])); // NSECSD
        port.push_response(ok_response(DLM_TRANSIT_CMD));

        let mut device = rig(port);
        let from = device.dlm_transit(DlmState::Dpl).unwrap();
        assert_eq!(from, DlmState::Nsecsd);

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(sent[1][3], DLM_TRANSIT_CMD);
        assert_eq!(&sent[1][4..6], &[0x03, 0x04]);
    }

    #[test]
    fn test_dlm_transit_rejects_regression_without_auth() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x02])); // SSD

        let mut device = rig(port);
        assert!(matches!(
            device.dlm_transit(DlmState::RmaReq),
            Err(Error::Precondition(_))
        ));

        // Only the state query went out.
        assert_eq!(device.port.sent_log().borrow().len(), 1);
    }

    #[test]
    fn test_dlm_transit_noop_when_already_there() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x04]));

        let mut device = rig(port);
        device.dlm_transit(DlmState::Dpl).unwrap();
        assert_eq!(device.port.sent_log().borrow().len(), 1);
    }

    #[test]
    fn test_dlm_transit_lck_boot_silence_is_success() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x04])); // DPL
        port.push_silence(); // bootloader hangs after LCK_BOOT

        let mut device = rig(port);
        let from = device.dlm_transit(DlmState::LckBoot).unwrap();
        assert_eq!(from, DlmState::Dpl);
    }

    #[test]
    fn test_dlm_authenticate_regression() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x03])); // NSECSD
        port.push_response(data_response(IDA_CMD, &[0x00; 16])); // challenge
        port.push_response(ok_response(IDA_CMD));

        let mut device = rig_with_map(port, ra4m2_areas());
        let from = device
            .dlm_authenticate(DlmState::Ssd, &[0u8; 16], false)
            .unwrap();
        assert_eq!(from, DlmState::Nsecsd);

        let sent = device.port.sent_log();
        let sent = sent.borrow();

        // Request: SDLM, DDLM, CHCT = random challenge.
        assert_eq!(sent[1][3], IDA_CMD);
        assert_eq!(&sent[1][4..7], &[0x03, 0x02, 0x00]);

        // Continuation frame carries the device-to-host SOD byte and
        // HMAC-SHA256(16 x 00, challenge || 32 x 00).
        assert_eq!(sent[2][0], 0x81);
        assert_eq!(sent[2][3], IDA_CMD);
        assert_eq!(
            hex(&sent[2][4..36]),
            "c30eb735be796b1095c4e0098268ee08322d38a2c589e12376054aaa65a9a07d"
        );
    }

    #[test]
    fn test_dlm_authenticate_rejects_invalid_pair() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x02])); // SSD

        let mut device = rig(port);
        assert!(matches!(
            device.dlm_authenticate(DlmState::Nsecsd, &[0u8; 16], false),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_dlm_authenticate_rejects_bad_key_length() {
        let mut device = rig(MockPort::new());
        assert!(matches!(
            device.dlm_authenticate(DlmState::Ssd, &[0u8; 8], false),
            Err(Error::Precondition(_))
        ));
        assert!(device.port.sent_log().borrow().is_empty());
    }

    #[test]
    fn test_dlm_authenticate_unique_id_only_for_rma() {
        let mut device = rig(MockPort::new());
        assert!(matches!(
            device.dlm_authenticate(DlmState::Ssd, &[0u8; 16], true),
            Err(Error::Precondition(_))
        ));
        assert!(device.port.sent_log().borrow().is_empty());
    }

    #[test]
    fn test_dlm_authenticate_rejects_grpc() {
        let mut device = rig(MockPort::new());
        let mut payload = crate::testutil::sig_payload(4);
        payload[5] = 0x02; // TYP: GrpC
        device.signature = Some(Signature::parse(&payload).unwrap());

        match device.dlm_authenticate(DlmState::Ssd, &[0u8; 16], false) {
            Err(Error::Precondition(msg)) => assert!(msg.contains("CMAC")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(device.port.sent_log().borrow().is_empty());
    }

    #[test]
    fn test_authenticate_id() {
        let mut port = MockPort::new();
        port.push_response(ok_response(IDA_CMD));

        let mut device = rig(port);
        assert!(!device.authenticated());
        device.authenticate_id(&crate::constants::ALERASE_ID).unwrap();
        assert!(device.authenticated());

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(&sent[0][4..11], b"ALeRASE");
    }

    #[test]
    fn test_initialize_rejects_cm() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x01])); // CM

        let mut device = rig(port);
        assert!(matches!(device.initialize(), Err(Error::Precondition(_))));
        assert_eq!(device.port.sent_log().borrow().len(), 1);
    }

    #[test]
    fn test_initialize_from_dpl() {
        let mut port = MockPort::new();
        port.push_response(data_response(DLM_CMD, &[0x04])); // DPL
        port.push_response(ok_response(INI_CMD));

        let mut device = rig(port);
        assert_eq!(device.initialize().unwrap(), DlmState::Dpl);

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(sent[1][3], INI_CMD);
        assert_eq!(&sent[1][4..6], &[0x04, 0x02]);
    }

    #[test]
    fn test_param_roundtrip() {
        let mut port = MockPort::new();
        port.push_response(data_response(PRM_CMD, &[PARAM_INIT_ENABLED]));
        port.push_response(ok_response(PRM_SET_CMD));

        let mut device = rig(port);
        assert_eq!(device.param(PARAM_ID_INIT).unwrap(), PARAM_INIT_ENABLED);
        device
            .set_param(PARAM_ID_INIT, PARAM_INIT_DISABLED)
            .unwrap();

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(&sent[1][4..6], &[PARAM_ID_INIT, PARAM_INIT_DISABLED]);
    }

    #[test]
    fn test_set_param_rejects_unknown_init_value() {
        let mut device = rig(MockPort::new());
        assert!(matches!(
            device.set_param(PARAM_ID_INIT, 0x05),
            Err(Error::Precondition(_))
        ));
        assert!(device.port.sent_log().borrow().is_empty());
    }
}
