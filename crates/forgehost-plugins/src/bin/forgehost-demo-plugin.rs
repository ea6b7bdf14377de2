//! Reference plugin executable used by the integration tests and as a
//! template for real plugins. Serves all three capabilities over stdio.

use std::process::ExitCode;

use forgehost_plugin_proto::{
    read_frame, write_frame, Call, Capability, DeclaredState, HandshakeConfig, PluginDetails,
    ProtoError, Request, Response, PROTOCOL_VERSION,
};

const ROUTES: [&str; 2] = ["/demo", "/demo/settings"];
const METHODS: [&str; 2] = ["avatar.render", "mail.send"];

fn details() -> PluginDetails {
    PluginDetails {
        name: "forgehost-demo-plugin".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "demo plugin exercising router and method capabilities".to_string(),
        state: DeclaredState::Running,
        capabilities: vec![Capability::Plugin, Capability::Router, Capability::Method],
    }
}

fn respond(call: Call) -> Response {
    match call {
        Call::Details => Response::Details(details()),
        Call::Routes => Response::Keys(ROUTES.iter().map(|s| s.to_string()).collect()),
        Call::HandleRoute { key } => {
            if ROUTES.contains(&key.as_str()) {
                Response::Done
            } else {
                Response::Err {
                    message: format!("unknown route: {key}"),
                }
            }
        }
        Call::Methods => Response::Keys(METHODS.iter().map(|s| s.to_string()).collect()),
        Call::GetMethod { key } => {
            if METHODS.contains(&key.as_str()) {
                Response::Done
            } else {
                Response::Err {
                    message: format!("unknown method: {key}"),
                }
            }
        }
    }
}

fn main() -> ExitCode {
    // Refuse to serve unless launched by a forgehost host process.
    if !HandshakeConfig::default().check_env() {
        eprintln!("forgehost-demo-plugin must be launched by a forgehost host");
        return ExitCode::FAILURE;
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut r = stdin.lock();
    let mut w = stdout.lock();

    loop {
        let request: Request = match read_frame(&mut r) {
            Ok(request) => request,
            // EOF or broken pipe means the host is gone.
            Err(ProtoError::Io(_)) => break,
            Err(error) => {
                let _ = write_frame(
                    &mut w,
                    &Response::Err {
                        message: error.to_string(),
                    },
                );
                continue;
            }
        };

        let response = match request {
            Request::Hello { version } => {
                if version == PROTOCOL_VERSION {
                    Response::HelloOk { version }
                } else {
                    Response::Err {
                        message: format!(
                            "protocol version mismatch: host={version}, plugin={PROTOCOL_VERSION}"
                        ),
                    }
                }
            }
            Request::Call(call) => respond(call),
            Request::Shutdown => break,
        };

        if write_frame(&mut w, &response).is_err() {
            break;
        }
    }

    ExitCode::SUCCESS
}
