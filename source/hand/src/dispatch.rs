//! Client command dispatch
//!
//! Command sockets carry one envelope each way per connection, text
//! monitors carry lines. Both end up as calls on the [Controller].

use std::time::Duration;

use han_comms::{
    controller::NetScan,
    envelope::{self, DaemonInfo, Request, Response, ResponseBody, ENVELOPE_SIZE},
    text::{self, TextCommand},
    BusSerial, Controller, Status,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{helper::Helper, server::BusMutex};

/// Budget for receiving the request envelope
pub const COMMAND_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for sending the response envelope
pub const COMMAND_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve one command connection: one request, one response, then close
///
/// Helper requests are handed to their own task, so the helper can not
/// stall the bus. Everything else is served before returning.
pub async fn serve_command<S, B>(
    ctrl: &Controller<BusMutex>,
    bus: &mut B,
    helper: &Helper,
    mut stream: S,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: BusSerial,
{
    let mut env = [0u8; ENVELOPE_SIZE];
    match timeout(COMMAND_RECV_TIMEOUT, stream.read_exact(&mut env)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            log::warn!("Command connection read failed: {}", e);
            return;
        }
        Err(_) => {
            log::warn!("Command connection timed out before a full request");
            return;
        }
    }

    let rsp = match envelope::decode::<Request>(&env) {
        Some(Request::Helper { command }) => {
            let helper = helper.clone();
            tokio::spawn(async move {
                let status = helper.run(&command).await;
                send_response(stream, &Response::status(status)).await;
            });
            return;
        }
        Some(req) => execute(ctrl, bus, helper, req).await,
        None => {
            log::warn!("Undecodable command request");
            Response::status(Status::CmdUnknown)
        }
    };
    send_response(stream, &rsp).await;
}

async fn send_response<S: AsyncWrite + Unpin>(mut stream: S, rsp: &Response) {
    let Some(env) = envelope::encode(rsp) else {
        log::error!("Response does not fit an envelope: {:?}", rsp.status);
        return;
    };
    match timeout(COMMAND_SEND_TIMEOUT, stream.write_all(&env)).await {
        Ok(Ok(())) => {
            let _ = stream.shutdown().await;
        }
        Ok(Err(e)) => log::warn!("Command connection write failed: {}", e),
        Err(_) => log::warn!("Command connection timed out sending the response"),
    }
}

/// Carry out a single request
pub async fn execute<B: BusSerial>(
    ctrl: &Controller<BusMutex>,
    bus: &mut B,
    helper: &Helper,
    req: Request,
) -> Response {
    log::debug!("Client request: {:?}", req);
    match req {
        Request::DaemonInfo => Response {
            status: Status::Ok,
            body: ResponseBody::DaemonInfo(DaemonInfo::new(env!("CARGO_PKG_VERSION"))),
        },
        Request::SendPacket(mut pkt) => {
            let status = ctrl.send(bus, &mut pkt).await.into();
            Response {
                status,
                body: ResponseBody::Packet(pkt),
            }
        }
        Request::NetScan => {
            let mut scan = NetScan::default();
            let status = ctrl.scan(bus, &mut scan).await.into();
            log::info!("Scan found {} node(s)", scan.nodes.len());
            Response {
                status,
                body: ResponseBody::NetScan(scan),
            }
        }
        Request::NetStats => Response {
            status: Status::Ok,
            body: ResponseBody::NetStats(ctrl.stats().await),
        },
        Request::NetStatsClear => Response {
            status: Status::Ok,
            body: ResponseBody::NetStats(ctrl.take_stats().await),
        },
        Request::Helper { command } => Response::status(helper.run(&command).await),
        Request::Raw(raw) => match ctrl.raw(bus, &raw).await {
            Ok(reply) => Response {
                status: Status::Ok,
                body: ResponseBody::Raw(reply),
            },
            Err(e) => Response::status(e.into()),
        },
    }
}

/// Handle one text monitor line, returning the reply line
///
/// `report` is the connection's interrupt reporting flag.
pub async fn text_command<B: BusSerial>(
    ctrl: &Controller<BusMutex>,
    bus: &mut B,
    line: &str,
    report: &mut bool,
) -> text::Reply {
    match text::parse(line) {
        Ok(TextCommand::Call(mut pkt)) => match ctrl.send(bus, &mut pkt).await {
            Ok(()) => text::status_reply(&pkt),
            Err(e) => text::error_reply(e.into()),
        },
        Ok(TextCommand::InterruptsOn) => {
            *report = true;
            fixed(text::OK)
        }
        Ok(TextCommand::InterruptsOff) => {
            *report = false;
            fixed(text::OK)
        }
        Err(e) => {
            log::debug!("Rejected text line {:?}: {:?}", line, e);
            fixed(text::ER)
        }
    }
}

fn fixed(s: &str) -> text::Reply {
    let mut out = text::Reply::new();
    let _ = out.push_str(s);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use han_comms::{controller::BusSettings, mock::MockBus, Packet};

    fn helper() -> Helper {
        Helper {
            path: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn stats_requests() {
        let ctrl = Controller::new(BusSettings {
            retries: 1,
            ..BusSettings::default()
        });
        let mut bus = MockBus::new();
        let pkt = Packet::new(0x40, 0x01);
        let rsp = execute(&ctrl, &mut bus, &helper(), Request::SendPacket(pkt)).await;
        assert_eq!(rsp.status, Status::RxTimeout);

        let rsp = execute(&ctrl, &mut bus, &helper(), Request::NetStatsClear).await;
        let ResponseBody::NetStats(stats) = rsp.body else {
            panic!("wrong body {:?}", rsp.body);
        };
        assert_eq!(stats.rx_timeouts, 2);

        let rsp = execute(&ctrl, &mut bus, &helper(), Request::NetStats).await;
        assert_eq!(rsp.body, ResponseBody::NetStats(Default::default()));
    }

    #[tokio::test]
    async fn info_and_helper() {
        let ctrl = Controller::new(BusSettings::default());
        let mut bus = MockBus::new();
        let rsp = execute(&ctrl, &mut bus, &helper(), Request::DaemonInfo).await;
        let ResponseBody::DaemonInfo(info) = rsp.body else {
            panic!("wrong body {:?}", rsp.body);
        };
        assert_eq!(info.version.as_str(), env!("CARGO_PKG_VERSION"));
        assert_eq!(usize::from(info.envelope_size), ENVELOPE_SIZE);

        let req = Request::Helper {
            command: heapless::String::try_from("on 3").unwrap(),
        };
        let rsp = execute(&ctrl, &mut bus, &helper(), req).await;
        assert_eq!(rsp.status, Status::HelperConfigError);
        assert!(bus.written().is_empty());
    }

    #[tokio::test]
    async fn text_lines() {
        let ctrl = Controller::new(BusSettings::default());
        let mut bus = MockBus::new();
        let mut report = false;

        let reply = text_command(&ctrl, &mut bus, "IE\n", &mut report).await;
        assert_eq!(reply.as_str(), "OK\n");
        assert!(report);
        let reply = text_command(&ctrl, &mut bus, "ID\n", &mut report).await;
        assert_eq!(reply.as_str(), "OK\n");
        assert!(!report);
        let reply = text_command(&ctrl, &mut bus, "CA123\n", &mut report).await;
        assert_eq!(reply.as_str(), "ER\n");
        assert!(bus.written().is_empty());
    }
}
