use {
    self::{config::*, writer::RotatingLogWriter},
    actix_web::{
        http::header::ContentType, web, web::Data, App, HttpRequest, HttpResponse, HttpServer,
        Responder,
    },
    clap::Parser,
    fast_logger::{error, info, warn, Generic, InDebug, Logger},
    maud::{html, Markup, DOCTYPE},
    serde_derive::{Deserialize, Serialize},
    sha2::{Digest, Sha512},
    std::{
        fs, io,
        path::PathBuf,
        sync::Arc,
        time::Instant,
    },
};

// ---

mod config;
mod request_log;
mod writer;

// ---

macro_rules! benchmark {
    ($lgr:expr, $e:expr) => {{
        let before = Instant::now();
        let result = $e;
        let after = Instant::now();
        $lgr(after - before);
        result
    }};
}

// ---

fn header() -> Markup {
    html! {
        meta charset="UTF-8";
        meta name="viewport" content="width=device-width,maximum-scale=1,minimum-scale=1,minimal-ui";
        meta name="robots" content="noindex";
    }
}

// ---

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> impl Responder {
    web::Json(Health { status: "ok" })
}

async fn unknown_route(state: web::Data<State>, request: HttpRequest) -> impl Responder {
    let request_string = format!("{:?}", request);
    info!(state.lgr, "Unknown route accessed"; "request" => request_string);
    HttpResponse::NotFound().finish()
}

// ---

#[derive(Clone, Deserialize)]
struct AdminCommandForm {
    act: String,
    key: String,
}

enum RanState {
    NoCommandToRun,
    WrongPassword,
    PasswordNotHex,
    RanCommand(String),
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        })
        .collect()
}

fn run_command(state: &State, act: &str) -> String {
    match act {
        "rotate" => {
            let rotated = benchmark! {
                |duration| info!(state.lgr, "Time to rotate request log"; "duration" => InDebug(&duration)),
                state.writer.rotate()
            };
            match rotated {
                Ok(()) => "Request log rotated".into(),
                Err(err) => {
                    let message = format!("Rotation failed: {}", err);
                    error!(state.lgr_important, "Manual rotation failed"; "error" => err);
                    message
                }
            }
        }
        "status" => format!(
            "state: {}\npath: {}\nsize: {} bytes",
            state.writer.state(),
            state.writer.path().display(),
            state.writer.current_size()
        ),
        _ => "Unknown command".into(),
    }
}

async fn do_admin(state: web::Data<State>, form: web::Form<AdminCommandForm>) -> impl Responder {
    let ran_command;

    if !form.act.is_empty() && !form.key.is_empty() {
        let act_clone = form.act.clone();
        info!(state.lgr, "Running admin command"; "act" => act_clone);
        match fs::read_to_string(&state.password_file) {
            Ok(password) => {
                if let Some(pw) = decode_hex(password.trim()) {
                    let result = Sha512::digest(form.key.as_bytes());
                    if result[..] == pw[..] {
                        ran_command = RanState::RanCommand(run_command(&state, form.act.trim()));
                    } else {
                        warn!(state.lgr_important, "Wrong admin key");
                        ran_command = RanState::WrongPassword;
                    }
                } else {
                    ran_command = RanState::PasswordNotHex;
                }
            }
            Err(err) => {
                error!(state.lgr_important, "Unable to read password file for admin commands"; "error" => err);
                ran_command = RanState::WrongPassword;
            }
        }
    } else {
        ran_command = RanState::NoCommandToRun;
    }

    admin_render(ran_command, &form.key)
}

async fn admin() -> impl Responder {
    admin_render(RanState::NoCommandToRun, "")
}

fn admin_render(ran_command: RanState, key: &str) -> HttpResponse {
    let html = html! {
        (DOCTYPE)
        html {
            head {
                (header())
                title { "Admin" }
            }
            body {
                p { "rotate - Rotates the request log now, the oldest archive is discarded" }
                p { "status - Shows the state, path and size of the active request log" }
                form action="admin" method="POST" {
                    input autofocus="" name="act" type="text" placeholder="Command" size="100";
                    br;
                    input name="key" type="password" placeholder="Key" value=(key);
                    br;
                    input type="submit" value="Submit";
                }
                br;
                pre {
                    @match ran_command {
                        RanState::NoCommandToRun => {
                            "No command run"
                        }
                        RanState::WrongPassword => {
                            "Wrong password"
                        }
                        RanState::PasswordNotHex => {
                            "Password is not in hex format on the server"
                        }
                        RanState::RanCommand(string) => {
                            "Command executed:\n"
                            pre class="feedback" {
                                (&string)
                            }
                        }
                    }
                }
            }
        }
    };
    HttpResponse::Ok()
        .insert_header(ContentType::html())
        .body(html.into_string())
}

// ---

#[derive(Clone)]
pub struct State {
    pub lgr: Logger<Generic>,
    pub lgr_important: Logger<Generic>,
    pub password_file: PathBuf,
    pub writer: Arc<RotatingLogWriter>,
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/health/", web::get().to(health))
        .route("/admin", web::get().to(admin))
        .route("/admin", web::post().to(do_admin))
        .default_service(web::route().to(unknown_route));
}

#[derive(Parser)]
#[command(name = "beacon-rs")]
#[command(about = "Health-check service with a size-rotated request log", long_about = None)]
struct Cli {
    /// Settings file in TOML, defaults are used when it does not exist
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let cli = Cli::parse();

    let lgr = Logger::spawn_with_writer("site", io::stderr());
    let lgr_important = Logger::spawn_with_writer("important", io::stderr());
    lgr.set_colorize(true);
    lgr.set_log_level(LOGLEVEL);
    lgr_important.set_colorize(true);
    lgr_important.set_log_level(LOGLEVEL_IMPORTANT);

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            let message = err.to_string();
            error!(lgr_important, "Unable to load settings"; "path" => InDebug(&cli.config), "error" => err);
            return Err(io::Error::new(io::ErrorKind::InvalidInput, message));
        }
    };
    lgr.set_log_level(settings.log_level);

    if let Some(parent) = settings.request_log.path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let state = State {
        lgr,
        lgr_important,
        password_file: settings.password_file.clone(),
        writer: Arc::new(RotatingLogWriter::new(&settings.request_log)),
    };

    let rotation = settings.request_log.clone();
    info!(state.lgr, "Initializing"; "working directory" => InDebug(&std::env::current_dir()), "request log" => InDebug(&rotation));

    let server_state = state.clone();
    let result = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .wrap_fn(|req, srv| request_log::log_request(req, srv))
            .configure(routes)
    })
    .bind((settings.host.as_str(), settings.port))?
    .run()
    .await;

    info!(state.lgr, "Shutting down");
    if let Err(err) = state.writer.close() {
        error!(state.lgr_important, "Unable to close request log"; "error" => err);
    }

    result
}
