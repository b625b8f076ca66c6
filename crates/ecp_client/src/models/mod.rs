// SPDX-License-Identifier: Apache-2.0

pub mod dsse;
pub mod simple_signing;
pub mod statement;
