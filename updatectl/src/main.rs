// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::ExitCode;

use clap::Parser;

mod dispatch;

#[tokio::main]
async fn main() -> ExitCode {
    let app = dispatch::UpdatectlApp::parse();
    match app.exec().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("updatectl: {error:#}");
            ExitCode::FAILURE
        }
    }
}
