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
    directory::{
        client::{DirectoryIdentity, start_directory},
        con::{DIRECTORY_SERVER_PORT, DirectoryCon},
    },
    dispatcher::{ProxyUdp, start_dispatcher},
    error::EchoError,
    proxy::{ProxyEvents, start_proxy},
    qso::{QsoCore, start_qso},
    telemetry,
};
use miette::{IntoDiagnostic, Result};
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::load().await?;

    telemetry::init()?;

    let gateway = config
        .gateway
        .clone()
        .ok_or_else(|| EchoError::InvalidArgument("no gateway config".to_owned()))?;

    info!(
        "Starting {} instance '{}' as {}",
        config.app.name,
        config.app.instance,
        gateway.callsign_upper()
    );

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("echolink-gw", move |s| async move {
            let servers = gateway.servers.clone();

            // With a proxy configured, both the directory connection and
            // all UDP traffic tunnel through it.
            let (con, proxy_udp) = match &gateway.proxy {
                Some(proxy_config) => {
                    let (handle, events) = start_proxy(&s, proxy_config.clone());
                    let ProxyEvents {
                        tcp,
                        udp_data,
                        udp_ctrl,
                        ready: _ready,
                    } = events;
                    let con = DirectoryCon::via_proxy(
                        servers,
                        DIRECTORY_SERVER_PORT,
                        handle.clone(),
                        tcp,
                    );
                    (
                        con,
                        Some(ProxyUdp {
                            handle,
                            data: udp_data,
                            ctrl: udp_ctrl,
                        }),
                    )
                }
                None => (DirectoryCon::new(servers, DIRECTORY_SERVER_PORT), None),
            };

            let (dispatcher, mut incoming) = start_dispatcher(
                &s,
                gateway.bind_address,
                gateway.port_base,
                proxy_udp,
            )
            .await?;

            let identity = DirectoryIdentity {
                callsign: gateway.callsign_upper(),
                password: gateway.password.clone(),
                description: gateway.description_trimmed(),
            };
            let (directory, _events) = start_directory(&s, identity, con);
            directory.make_online().await;

            // Auto-accept incoming connections: every caller gets a session.
            let callsign = gateway.callsign_upper();
            let display_name = gateway.display_name.clone();
            let description = gateway.description_trimmed();
            let use_gsm_only = gateway.use_gsm_only;
            while let Some(connection) = incoming.recv().await {
                info!(
                    "Accepting connection from {} ({})",
                    connection.callsign, connection.ip
                );
                let core = QsoCore::with_options(
                    connection.ip,
                    &callsign,
                    &display_name,
                    &description,
                    use_gsm_only,
                );
                match start_qso(&dispatcher, core) {
                    Ok((api, _events)) => {
                        api.accept().await;
                    }
                    Err(e) => tracing::warn!("Could not create session: {e}"),
                }
            }

            Ok::<(), EchoError>(())
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await
    .into_diagnostic()?;

    Ok(())
}
