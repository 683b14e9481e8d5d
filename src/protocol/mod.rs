// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Wire-level primitives shared by the SMTP, IMAP, and POP3 sessions
//! (`spec.md` §4.4).

pub mod dotstuff;
pub mod framing;

pub use framing::{LineReader, ReadOutcome};
