// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Signals which may be passed from the parent process handle to the
/// worker and control threads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}
