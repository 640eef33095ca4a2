// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod cmdline;
pub mod config;
pub mod data_logger;
pub mod files;
pub mod monitor;
