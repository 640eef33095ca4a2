// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

#[derive(FromArgs, Debug)]
/// Supervisor for multichannel high-voltage source boards.
pub struct Args {
    /// path to a CSV file containing device addresses
    #[argh(positional, arg_name = "DEVICES")]
    pub devices: PathBuf,

    /// path to a CSV file containing parameters of voltage cells
    #[argh(option, arg_name = "PATH")]
    pub profile: Option<PathBuf>,

    /// path to a JSON configuration file
    #[argh(option, arg_name = "PATH")]
    pub cfg: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_and_options() {
        let args = Args::from_args(&["hvsup"], &["devices.csv", "--profile", "p.csv"]).unwrap();
        assert_eq!(args.devices, PathBuf::from("devices.csv"));
        assert_eq!(args.profile, Some(PathBuf::from("p.csv")));
        assert_eq!(args.cfg, None);
    }

    #[test]
    fn devices_is_required() {
        assert!(Args::from_args(&["hvsup"], &[]).is_err());
    }
}
