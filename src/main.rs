//! termhub demo binary
//!
//! ```text
//! termhub              local shell
//! termhub list         saved configs
//! termhub open <name>  saved SSH config
//! ```
//!
//! Stdin is forwarded as-is and output is written to stdout without any
//! terminal emulation.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use termhub::config::{CredentialVault, FilePreferences};
use termhub::session::{SessionError, SessionRegistry, TerminalSink};
use tokio::io::AsyncReadExt;

const USAGE: &str = "usage: termhub [list | open <name>]";

#[tokio::main]
async fn main() -> ExitCode {
    termhub::init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("termhub: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<ExitCode, SessionError> {
    let vault = Arc::new(CredentialVault::open_default()?);
    let store = Arc::new(FilePreferences::new()?);
    let registry = SessionRegistry::new(vault, store);
    registry.load().await?;

    let sink: Arc<dyn TerminalSink> = Arc::new(|data: &[u8]| {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data);
        let _ = out.flush();
    });

    let pending = match args {
        [] => {
            #[cfg(feature = "local-terminal")]
            {
                registry.open_local(sink)
            }
            #[cfg(not(feature = "local-terminal"))]
            {
                eprintln!("termhub: built without local terminal support");
                return Ok(ExitCode::FAILURE);
            }
        }
        [cmd] if cmd == "list" => {
            for config in registry.configs() {
                println!("{}\t{}", config.kind(), config.name());
            }
            return Ok(ExitCode::SUCCESS);
        }
        [cmd, name] if cmd == "open" => registry.open_config(name, sink)?,
        _ => {
            eprintln!("{}", USAGE);
            return Ok(ExitCode::from(2));
        }
    };

    let session = pending.wait().await?;
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            _ = session.closed() => break,
            read = stdin.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    session.close();
                    break;
                }
                Ok(n) => {
                    if session.send_bytes(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    session.closed().await;
    registry.close_all();
    Ok(ExitCode::SUCCESS)
}
