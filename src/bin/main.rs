use nix::unistd::Uid;
use std::error::Error;
use std::io;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use svcinit::{
    cli::{Cli, Commands, parse_args},
    config::load_config,
    constants::PROPERTY_SOCKET_NAME,
    property::client,
    runtime::{self, RuntimeMode},
    supervisor::Supervisor,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let euid = Uid::effective();

    let runtime_mode = if args.sys {
        if !euid.is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "--sys requires root privileges",
            )
            .into());
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };

    runtime::init(runtime_mode);
    runtime::set_drop_privileges(args.drop_privileges);
    if args.drop_privileges && !euid.is_root() {
        warn!("--drop-privileges has no effect when not running as root");
    }
    runtime::capture_socket_activation();
    init_logging(&args);

    if euid.is_root() && runtime_mode == RuntimeMode::User {
        warn!("running as root without --sys; state will be stored in userspace paths");
    }

    match args.command {
        Commands::Run { config } => run_supervisor(&config),
        Commands::Start { service } => ctl("start", &service),
        Commands::Stop { service } => ctl("stop", &service),
        Commands::Restart { service } => ctl("restart", &service),
        Commands::Status { service } => status(&service),
        Commands::Setprop { name, value } => setprop(&name, &value),
        Commands::Getprop { name } => getprop(&name),
        Commands::Exec { argv } => exec(&argv),
    }
}

fn run_supervisor(config_path: &str) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let mut supervisor = Supervisor::new(config)?;
    supervisor.run()?;
    Ok(())
}

fn ctl(verb: &str, service: &str) -> Result<(), Box<dyn Error>> {
    let socket_path = runtime::socket_dir().join(PROPERTY_SOCKET_NAME);
    let code = client::ctl(&socket_path, verb, service)?;
    if code != 0 {
        return Err(format!("{verb} '{service}' failed with code {code}").into());
    }
    println!("{verb}: {service}");
    Ok(())
}

fn status(service: &str) -> Result<(), Box<dyn Error>> {
    let socket_path = runtime::socket_dir().join(PROPERTY_SOCKET_NAME);
    let name = format!("{}{service}", svcinit::constants::SERVICE_STATE_PREFIX);
    match client::getprop(&socket_path, &name)? {
        Some(value) => println!("{service}: {value}"),
        None => println!("{service}: unknown"),
    }
    Ok(())
}

fn setprop(name: &str, value: &str) -> Result<(), Box<dyn Error>> {
    let socket_path = runtime::socket_dir().join(PROPERTY_SOCKET_NAME);
    let code = client::setprop(&socket_path, name, value)?;
    if code != 0 {
        return Err(format!("setprop '{name}' failed with code {code}").into());
    }
    Ok(())
}

fn exec(argv: &[String]) -> Result<(), Box<dyn Error>> {
    let socket_path = runtime::socket_dir().join(PROPERTY_SOCKET_NAME);
    let code = client::exec_oneshot(&socket_path, argv)?;
    if code != 0 {
        return Err(format!("exec '{}' failed with code {code}", argv.join(" ")).into());
    }
    Ok(())
}

fn getprop(name: &str) -> Result<(), Box<dyn Error>> {
    let socket_path = runtime::socket_dir().join(PROPERTY_SOCKET_NAME);
    match client::getprop(&socket_path, name)? {
        Some(value) => println!("{value}"),
        None => println!(),
    }
    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
