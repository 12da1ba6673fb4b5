// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod crypto;
pub mod error;
pub mod init;
pub mod pipeline;
pub mod schema;
pub mod state;
pub mod tailer;
pub mod transport;
pub mod uploader;
