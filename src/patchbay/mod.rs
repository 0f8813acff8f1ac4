// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C6: the patchbay engine that grafts VM-routing export symbols
//! into a host image's dynamic symbol table.

pub mod alias;
pub mod hash;

pub use alias::{apply_aliases, AliasPair};
