use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use dbpfpress::{validate_package, write_package, Mode, Package};

#[derive(Parser)]
#[command(name = "dbpfpress")]
#[command(about = "Recompress Sims 2 DBPF package files", long_about = None)]
struct Cli {
    /// Package file or directory to process recursively
    path: PathBuf,

    /// Decompress entries instead of recompressing them
    #[arg(short = 'd', long)]
    decompress: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mode = if cli.decompress {
        Mode::Decompress
    } else {
        Mode::Recompress
    };

    if cli.path.is_file() {
        if cli.path.extension().map_or(true, |ext| ext != "package") {
            println!("Not a package file");
            return;
        }
        process_file(&cli.path, &cli.path.display().to_string(), mode);
    } else if cli.path.is_dir() {
        for entry in WalkDir::new(&cli.path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_type().is_file()
                    && e.path().extension().map_or(false, |ext| ext == "package")
            })
        {
            let display = entry
                .path()
                .strip_prefix(&cli.path)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            process_file(entry.path(), &display, mode);
        }
    } else {
        println!("File not found");
        return;
    }

    println!();
}

/// Deletes `path` without complaint; the caller keeps going either way.
fn try_delete(path: &Path) {
    let _ = fs::remove_file(path);
}

fn format_size(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    if kb >= 1000.0 {
        format!("{:.2} MB", kb / 1024.0)
    } else {
        format!("{kb:.2} KB")
    }
}

/// Process one package file: parse, transform into a sibling temp file,
/// validate, and replace the original.  Every failure prints one line and
/// leaves the original untouched.
fn process_file(path: &Path, display: &str, mode: Mode) {
    let old_size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => {
            println!("{display}: Failed to open file");
            return;
        }
    };

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => {
            println!("{display}: Failed to open file");
            return;
        }
    };

    let mut package = match Package::read(&mut file, mode) {
        Ok(p) => p,
        Err(err) => {
            println!("{display}: {err}");
            return;
        }
    };
    let old_package = package.clone();

    // Skip conditions: our own signature at the current size means a
    // recompression pass already ran, and a package with nothing
    // compressed has nothing to decompress.
    let skip = match mode {
        Mode::Recompress => package.signature_present,
        Mode::Decompress => package.entries.iter().all(|e| !e.compressed),
    };

    if !skip {
        let mut temp_name = OsString::from(path.as_os_str());
        temp_name.push(".new");
        let temp_path = PathBuf::from(temp_name);

        let mut temp = match File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
        {
            Ok(f) => f,
            Err(_) => {
                println!("{display}: Failed to create temp file");
                return;
            }
        };

        if let Err(err) = write_package(&mut temp, &mut file, &mut package, mode) {
            println!("{display}: {err}");
            try_delete(&temp_path);
            return;
        }

        if let Err(err) = temp.seek(SeekFrom::Start(0)) {
            println!("{display}: {err}");
            try_delete(&temp_path);
            return;
        }

        let new_package = match Package::read(&mut temp, mode) {
            Ok(p) => p,
            Err(err) => {
                println!("{display}: {err}");
                try_delete(&temp_path);
                return;
            }
        };

        if let Err(err) = validate_package(&old_package, &new_package, &mut file, &mut temp, mode)
        {
            println!("{display}: {err}");
            try_delete(&temp_path);
            return;
        }

        drop(file);
        drop(temp);

        if fs::rename(&temp_path, path).is_err() {
            println!("{display}: Failed to overwrite file");
            try_delete(&temp_path);
            return;
        }
    }

    let new_size = fs::metadata(path).map(|m| m.len()).unwrap_or(old_size);
    println!(
        "{display} {} -> {}",
        format_size(old_size),
        format_size(new_size)
    );
}
