// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Persistence of fit outcomes, noise models and configurations.

use crate::error::{FwrfError, FwrfResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FwrfError + '_ {
    move |source| FwrfError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn save_json<T: Serialize + ?Sized, P: AsRef<Path>>(value: &T, path: P) -> FwrfResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(io_error(path))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> FwrfResult<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(io_error(path))?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn save_bincode<T: Serialize + ?Sized, P: AsRef<Path>>(value: &T, path: P) -> FwrfResult<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(io_error(path))?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, value)?;
    Ok(())
}

pub fn load_bincode<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> FwrfResult<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(io_error(path))?;
    let reader = BufReader::new(file);
    Ok(bincode::deserialize_from(reader)?)
}
