/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use miette::Diagnostic;
use std::io;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

#[derive(Error, Debug, Diagnostic)]
pub enum EchoError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("transport down: {0}")]
    TransportDown(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("not registered with the directory server")]
    NotRegistered,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("codec error: {0}")]
    CodecError(String),
    #[error("API error.")]
    ApiError(#[from] oneshot::error::RecvError),
    #[error("General error: {0}")]
    Other(String),
}

pub type EchoResult<T> = Result<T, EchoError>;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Tracing init error: {0}")]
    TryInitError(#[from] TryInitError),
    #[error("Tracing config parse error: {0}")]
    ParseError(#[from] ParseError),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
