//! Build script for the `overcast` man pages.
//!
//! Packaging picks the pages up from the build output directory: one for
//! the top-level command and one per subcommand.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(man: &Man, out_dir: &Path, page: &str) -> io::Result<()> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(out_dir.join(format!("{page}.1")), buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(
        env::var_os("OUT_DIR")
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?,
    );

    let command = Cli::command();
    for subcommand in command.get_subcommands() {
        let page = format!("overcast-{}", subcommand.get_name());
        let man = Man::new(subcommand.clone()).title(page.to_uppercase());
        render(&man, &out_dir, &page)?;
    }
    render(&Man::new(command), &out_dir, "overcast")?;

    Ok(())
}
