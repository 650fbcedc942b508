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

pub const INQ_CMD: u8           = 0x00;
pub const ERA_CMD: u8           = 0x12;
pub const WRI_CMD: u8           = 0x13;
pub const REA_CMD: u8           = 0x15;
pub const CRC_CMD: u8           = 0x18;
pub const KEY_CMD: u8           = 0x28;
pub const KEY_VFY_CMD: u8       = 0x29;
pub const UKEY_CMD: u8          = 0x2A;
pub const UKEY_VFY_CMD: u8      = 0x2B;
pub const DLM_CMD: u8           = 0x2C;
pub const IDA_CMD: u8           = 0x30;
pub const BAU_CMD: u8           = 0x34;
pub const SIG_CMD: u8           = 0x3A;
pub const ARE_CMD: u8           = 0x3B;
pub const BND_SET_CMD: u8       = 0x4E;
pub const BND_CMD: u8           = 0x4F;
pub const INI_CMD: u8           = 0x50;
pub const PRM_SET_CMD: u8       = 0x51;
pub const PRM_CMD: u8           = 0x52;
pub const DLM_TRANSIT_CMD: u8   = 0x71;

/// Start of data, host to device.
pub const SOD_CMD: u8           = 0x01;
/// Start of data, device to host. Also used by the host for the data
/// frames of a write stream and the authentication continuation frame.
pub const SOD_ACK: u8           = 0x81;
/// End of transmission.
pub const ETX: u8               = 0x03;
/// High bit of the RES byte on an error response.
pub const STATUS_ERR: u8        = 0x80;

/// Maximum DATA length per frame.
pub const MAX_DATA_LEN: usize   = 1024;
/// SOD + LNH + LNL + CMD + data + SUM + ETX.
pub const MAX_PKT_LEN: usize    = MAX_DATA_LEN + 6;
/// Read/write transfer unit. The boot firmware's multi-packet ACK handling
/// is unreliable, so every transfer stays within a single packet.
pub const CHUNK_SIZE: usize     = 1024;

/// Connection synchronization byte.
pub const SYNC_BYTE: u8         = 0x00;
/// Generic code sent to confirm the boot interface.
pub const GENERIC_CODE: u8      = 0x55;
/// Boot code replies to the generic code.
pub const BOOT_CODE_M4: u8      = 0xC3;
pub const BOOT_CODE_M85: u8     = 0xC5;
pub const BOOT_CODE_M33: u8     = 0xC6;

/// "Initialize command enabled" parameter.
pub const PARAM_ID_INIT: u8       = 0x01;
pub const PARAM_INIT_DISABLED: u8 = 0x00;
pub const PARAM_INIT_ENABLED: u8  = 0x07;

/// ID code and DLM key sizes.
pub const ID_CODE_LEN: usize    = 16;
pub const DLM_KEY_LEN: usize    = 16;
pub const CHALLENGE_LEN: usize  = 16;
/// Zero-filled value appended to the challenge before computing the MAC.
pub const AUTH_FIXED_LEN: usize = 32;
/// Largest wrapped key blob the KEY/UKEY commands accept.
pub const WRAPPED_KEY_MAX: usize = 48;

/// Magic ID code that requests total area erasure (needs
/// OSIS[127:126] = 10b on the device).
pub const ALERASE_ID: [u8; ID_CODE_LEN] = [
    b'A', b'L', b'e', b'R', b'A', b'S', b'E',
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// USB IDs of the Renesas boot interface (USB-CDC).
pub const RENESAS_VID: u16      = 0x045B;
pub const RENESAS_PID: u16      = 0x0261;

/// Handshake retry policy.
pub const MAX_TRIES: u32        = 20;
pub const TIMEOUT_MS: u64       = 100;
