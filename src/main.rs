use parley::{capture, history};
use parley::messages::Source;
use parley::settings::{self, Settings};
use parley::state::{Mode, SessionSnapshot, SessionStatus};
use parley::ticker::SystemClock;
use parley::{RuntimeOptions, SessionController, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

fn main() {
    env_logger::init();

    let mut settings = settings::load();
    if let Ok(path) = settings::settings_path() {
        if !path.exists() {
            match settings::save(&settings) {
                Ok(()) => log::info!("[settings] wrote defaults to {}", path.display()),
                Err(e) => log::warn!("[settings] could not write defaults: {}", e),
            }
        }
    }
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--text" => settings.mode = Mode::Text,
            "--voice" => settings.mode = Mode::Voice,
            "--session" => match args.next() {
                Some(id) => settings.session_id = id,
                None => {
                    eprintln!("[parley] --session needs an id");
                    return;
                }
            },
            "--server" => match args.next() {
                Some(url) => settings.server_url = url,
                None => {
                    eprintln!("[parley] --server needs a url");
                    return;
                }
            },
            other => {
                eprintln!("[parley] unknown argument {}", other);
                eprintln!("usage: parley [--text|--voice] [--session <id>] [--server <url>]");
                return;
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("[parley] failed to create tokio runtime: {}", e);
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(settings));
}

async fn run(settings: Settings) {
    let format = settings.recording_format();
    let resume = settings.resume_session();
    let mut controller = SessionController::new(
        settings.controller_config(),
        resume.clone(),
        Arc::new(SystemClock::new()),
    );

    if let Some(id) = resume.as_deref().filter(|_| settings.resume_history) {
        match history::fetch_history(&settings.server_url, id).await {
            Ok(messages) => controller.preload_history(messages),
            Err(e) => log::warn!("[history] could not load session {}: {}", id, e),
        }
    }

    let options = RuntimeOptions {
        url: settings.endpoint_url(),
        input_device: non_empty(&settings.mic_device),
        output_device: non_empty(&settings.output_device),
        volume: settings.volume,
        format,
    };
    let handle = parley::spawn(controller, options);
    println!(
        "session {} ({:?} mode, recording as {})",
        handle.snapshot().session_id,
        settings.mode,
        format.mime
    );
    println!("commands: /rec /stop /cancel /interrupt /volume <0..1> /devices /quit; anything else is sent as text");

    tokio::task::spawn_local(watch_snapshots(handle.clone()));
    handle.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("[parley] stdin read failed: {}", e);
                break;
            }
        };
        if !dispatch(&handle, line.trim()) {
            break;
        }
    }

    let mut rx = handle.subscribe();
    handle.shutdown();
    // The snapshot channel closes once the controller has torn down.
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while rx.changed().await.is_ok() {}
    })
    .await;
}

/// Returns false when the user asked to quit.
fn dispatch(handle: &SessionHandle, line: &str) -> bool {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "" => {}
        "/quit" | "/exit" => return false,
        "/rec" => handle.start_recording(),
        "/stop" => handle.stop_recording(),
        "/cancel" => handle.cancel_recording(),
        "/interrupt" => handle.interrupt(),
        "/disconnect" => handle.disconnect(),
        "/connect" => handle.connect(),
        "/devices" => {
            for name in capture::list_input_devices() {
                println!("  {}", name);
            }
        }
        "/volume" => match rest.trim().parse::<f32>() {
            Ok(v) => handle.set_volume(v),
            Err(_) => println!("usage: /volume <0..1>"),
        },
        _ => handle.send_text_message(line),
    }
    true
}

async fn watch_snapshots(handle: SessionHandle) {
    let mut rx = handle.subscribe();
    let mut last = rx.borrow().clone();
    let mut printed = 0;
    report(&last, &last, &mut printed);
    while rx.changed().await.is_ok() {
        let next = rx.borrow_and_update().clone();
        report(&last, &next, &mut printed);
        last = next;
    }
}

fn report(prev: &SessionSnapshot, next: &SessionSnapshot, printed: &mut usize) {
    if prev.status != next.status {
        println!("[{}]", next.status);
    }
    // The newest message may still be streaming until the session goes quiet.
    let settled = match next.status {
        SessionStatus::Idle | SessionStatus::Disconnected => next.messages.len(),
        _ => next.messages.len().saturating_sub(1),
    };
    for msg in next.messages.iter().take(settled).skip(*printed) {
        print_message(msg.source, &msg.text);
        if let Some(tasks) = &msg.tasks {
            for task in tasks {
                println!("    - [{:?}] {}", task.status, task.description);
            }
        }
    }
    *printed = (*printed).max(settled);
    if prev.tasks != next.tasks {
        for task in &next.tasks {
            println!("  task {} {:?}: {}", task.id, task.status, task.description);
        }
    }
}

fn print_message(source: Source, text: &str) {
    match source {
        Source::User => println!("you> {}", text),
        Source::Assistant => println!("assistant> {}", text),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
