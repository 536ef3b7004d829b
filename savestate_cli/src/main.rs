use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use savestate_engine::config::parse_strategy;
use savestate_engine::net::OscSender;
use savestate_engine::{EngineConfig, EngineHost, EventReceiver, MainLoop, ProfileStore, SessionEvent};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "savestates", about = "Save and restore avatar parameter profiles")]
struct Args {
    /// Storage root; profiles live under `<DIR>/Profiles/<avatar>`.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Work on this avatar's stored profiles without connecting.
    #[arg(long)]
    avatar: Option<String>,

    /// How long to wait for the remote service to show up.
    #[arg(long, default_value_t = 15)]
    wait_secs: u64,

    #[arg(long, value_name = "HOST:PORT")]
    osc_send: Option<std::net::SocketAddr>,

    /// `whole` or `per_path`.
    #[arg(long)]
    fetch_strategy: Option<String>,

    #[arg(long, default_value_t = false)]
    writable_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List one page of profiles.
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Print the parameters stored in a profile.
    Show { name: String },
    /// Capture the live parameters into a new profile.
    Save { name: Option<String> },
    /// Capture the live parameters into an existing profile.
    Override { name: String },
    Apply {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        index: Option<u32>,
    },
    Delete {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        index: Option<u32>,
    },
    Rename { name: String, new_name: String },
    /// Copy all profiles of one avatar onto another (default: the current one).
    Copy {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Show or set the avatar's display name.
    Name { name: Option<String> },
    /// Print session events until interrupted.
    Watch,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = config_from(&args)?;

    if let Some(avatar) = args.avatar.clone() {
        return run_offline(&config, &avatar, args.command);
    }

    let (host, mut main_loop, events) = EngineHost::start(&config)?;
    let wait = Duration::from_secs(args.wait_secs);
    let result = match args.command {
        Command::Watch => watch(&mut main_loop, &events),
        command => {
            let endpoint = main_loop.wait_connected(wait)?;
            eprintln!("connected: {endpoint}");
            run_live(&mut main_loop, command)
        }
    };
    main_loop.shutdown();
    host.shutdown();
    result
}

fn config_from(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::from_env();
    if let Some(dir) = &args.data_dir {
        config.storage_root = dir.clone();
    }
    if let Some(addr) = args.osc_send {
        config.osc_send_addr = addr;
    }
    if let Some(s) = &args.fetch_strategy {
        config.fetch_strategy =
            parse_strategy(s).ok_or_else(|| anyhow!("unknown fetch strategy {s:?}"))?;
    }
    if args.writable_only {
        config.writable_only = true;
    }
    Ok(config)
}

fn run_offline(config: &EngineConfig, avatar: &str, command: Command) -> anyhow::Result<()> {
    let mut store = ProfileStore::new(&config.storage_root, config.page_size);
    store.load_profiles(avatar)?;
    match command {
        Command::Save { .. } | Command::Override { .. } | Command::Watch => {
            Err(anyhow!("this command needs a live connection; drop --avatar"))
        }
        Command::Apply { name, index } => {
            let sink = OscSender::connect(config.osc_send_addr)?;
            let report = match (name, index) {
                (_, Some(i)) => store.apply_profile_at(avatar, i, &sink)?,
                (Some(n), None) => store.apply_profile(avatar, &n, &sink)?,
                (None, None) => return Err(anyhow!("apply needs a name or --index")),
            };
            print_report(report.sent, report.skipped.len());
            Ok(())
        }
        command => run_store_command(&mut store, avatar, command),
    }
}

fn run_live(main_loop: &mut MainLoop, command: Command) -> anyhow::Result<()> {
    let avatar = main_loop
        .current_avatar()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("remote did not report an avatar"))?;
    eprintln!("avatar: {avatar}");

    match command {
        Command::Save { name } => {
            let entry = main_loop.save_profile(name.as_deref().unwrap_or(""))?;
            eprintln!("saved #{} {}", entry.index.unwrap_or_default(), entry.display_name);
        }
        Command::Override { name } => {
            main_loop.override_profile(&name)?;
            eprintln!("overrode {name}");
        }
        Command::Apply { name, index } => {
            let report = match (name, index) {
                (_, Some(i)) => main_loop.apply_profile_at(i)?,
                (Some(n), None) => main_loop.apply_profile(&n)?,
                (None, None) => return Err(anyhow!("apply needs a name or --index")),
            };
            print_report(report.sent, report.skipped.len());
        }
        Command::Copy { from: None, to: None } => {
            let copied = main_loop.copy_from_previous()?;
            eprintln!("copied {copied} file(s) from the previous avatar");
        }
        command => run_store_command(main_loop.store_mut(), &avatar, command)?,
    }
    Ok(())
}

fn run_store_command(store: &mut ProfileStore, avatar: &str, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List { page } => {
            store.set_page(page.saturating_sub(1));
            let total = store.total_pages().max(1);
            println!("page {}/{total} ({} profiles)", store.current_page() + 1, store.entries().len());
            for entry in store.current_page_profiles() {
                match entry.index {
                    Some(i) => println!("{i:>4}  {}", entry.display_name),
                    None => println!("   -  {}", entry.display_name),
                }
            }
        }
        Command::Show { name } => {
            let entry = store
                .find(&name)
                .cloned()
                .ok_or_else(|| anyhow!("profile {name:?} not found"))?;
            let snapshot = store.read_snapshot(&entry)?;
            for e in snapshot.iter() {
                println!("{} = {} ({})", e.address, e.value, e.type_tag);
            }
        }
        Command::Delete { name, index } => {
            let deleted = match (name, index) {
                (_, Some(i)) => store.delete_profile_at(avatar, i)?,
                (Some(n), None) => store.delete_profile(avatar, &n)?,
                (None, None) => return Err(anyhow!("delete needs a name or --index")),
            };
            if deleted {
                eprintln!("deleted");
            } else {
                eprintln!("not found");
            }
        }
        Command::Rename { name, new_name } => {
            store.rename_profile(avatar, &name, &new_name)?;
            eprintln!("renamed {name} -> {new_name}");
        }
        Command::Copy { from, to } => {
            let from = from.ok_or_else(|| anyhow!("copy needs --from"))?;
            let to = to.unwrap_or_else(|| avatar.to_string());
            let copied = store
                .copy_profiles_from_avatar(&from, &to)
                .with_context(|| format!("copying {from} -> {to}"))?;
            eprintln!("copied {copied} file(s)");
        }
        Command::Name { name: Some(name) } => {
            store.save_avatar_name(avatar, &name)?;
            eprintln!("name set");
        }
        Command::Name { name: None } => match store.load_avatar_name(avatar)? {
            Some(name) => println!("{name}"),
            None => eprintln!("no name stored"),
        },
        Command::Save { .. } | Command::Override { .. } | Command::Apply { .. } | Command::Watch => {
            return Err(anyhow!("unsupported here"));
        }
    }
    Ok(())
}

fn watch(
    main_loop: &mut MainLoop,
    events: &EventReceiver,
) -> anyhow::Result<()> {
    eprintln!("status: {:?}", main_loop.status());
    loop {
        main_loop.tick_blocking(Duration::from_millis(250));
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::AvatarConnected(endpoint) => println!("connected {endpoint}"),
                SessionEvent::AvatarChanged { previous, current } => {
                    let count = main_loop.store().entries().len();
                    match previous {
                        Some(p) => println!("avatar {p} -> {current} ({count} profiles)"),
                        None => println!("avatar {current} ({count} profiles)"),
                    }
                }
                SessionEvent::ConnectionLost => println!("connection lost"),
            }
        }
    }
}

fn print_report(sent: usize, skipped: usize) {
    if skipped == 0 {
        eprintln!("applied {sent} parameter(s)");
    } else {
        eprintln!("applied {sent} parameter(s), skipped {skipped}");
    }
}
