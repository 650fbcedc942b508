// Copyright 2021 Locha Mesh Developers <contact@locha.io>
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

//! Progress reporting seam between the flash engine and its caller.
//! The library itself never renders anything; installing a sink is up
//! to the frontend.

/// Receives progress updates from long-running flash operations.
pub trait ProgressSink {
    /// A new operation over `total` bytes starts.
    fn begin(&mut self, total: u64, desc: &str);
    /// `current` bytes are done.
    fn update(&mut self, current: u64);
    /// The operation finished (successfully or not).
    fn finish(&mut self);
}

/// Discards all updates.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn begin(&mut self, _total: u64, _desc: &str) {}
    fn update(&mut self, _current: u64) {}
    fn finish(&mut self) {}
}
