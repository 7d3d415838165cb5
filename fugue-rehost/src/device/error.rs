//! device errors

use thiserror::Error;

use crate::types::Irq;
use crate::{peripheral, snapshot, trace};

#[derive(Debug, Error)]
pub enum Error {
    #[error("trace does not access any address")]
    EmptyTrace,
    #[error("device is already trained; merge a separately trained device instead")]
    AlreadyTrained,
    #[error("peripheral `{0}` overlaps peripheral `{1}`")]
    Overlap(String, String),
    #[error("interrupt {0} is assigned to unknown peripheral `{1}`")]
    UnknownPeripheral(Irq, String),
    #[error(transparent)]
    Trace(#[from] trace::Error),
    #[error(transparent)]
    Snapshot(#[from] snapshot::Error),
    #[error(transparent)]
    Peripheral(#[from] peripheral::Error),
}
