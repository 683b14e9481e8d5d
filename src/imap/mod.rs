// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! IMAP4rev1 engine (`spec.md` §4.7).

pub mod command;
pub mod response;
pub mod session;

pub use session::ImapSession;
