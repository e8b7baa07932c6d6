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

use echolink_gw::{
    config::Config,
    error::EchoError,
    remotetrx::{NetTrxAdapter, NetUplink},
    telemetry,
    trx::RxCommand,
    voter::{SubReceiver, start_voter},
};
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::load().await?;

    telemetry::init()?;

    let remotetrx = config
        .remotetrx
        .clone()
        .ok_or_else(|| EchoError::InvalidArgument("no remotetrx config".to_owned()))?;
    let voter_config = config.voter.clone();

    info!(
        "Starting {} instance '{}'",
        config.app.name, config.app.instance
    );

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("remote-trx", move |s| async move {
            // The adapter's far face stands in for the radio hardware; the
            // near face is what the uplink serves to the core.
            let (near, far) = NetTrxAdapter::start(&s, remotetrx.siglev);
            far.rx.commands.send(RxCommand::Mute(false)).await.ok();

            // With a voter section configured the uplink serves the voter
            // instead of the bare receiver, so squelch arbitration happens
            // on the site side of the link.
            let rx = match voter_config {
                Some(voter_config) => {
                    let port = start_voter(
                        &s,
                        voter_config,
                        vec![SubReceiver {
                            name: "rx1".to_owned(),
                            port: near.rx,
                        }],
                    );
                    port.commands.send(RxCommand::Mute(false)).await.ok();
                    port
                }
                None => near.rx,
            };

            let addr = NetUplink::start(&s, remotetrx, rx, near.tx).await?;
            info!("Remote transceiver ready on {addr}");

            // The far face stays parked here; site integrations drive it.
            let _far = far;
            std::future::pending::<()>().await;

            Ok::<(), EchoError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await
    .into_diagnostic()?;

    Ok(())
}
