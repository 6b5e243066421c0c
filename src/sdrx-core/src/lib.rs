// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

pub mod channel;
pub mod error;
pub mod modes;
pub mod radio;

pub type DynResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub use channel::{ChannelKind, ChannelState, DesiredChannel, Squelch};
pub use error::{CoreError, CoreResult};
pub use modes::Mode;
pub use radio::freq::Freq;
