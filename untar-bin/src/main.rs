use std::path::Path;

use anyhow::{format_err, Error};

use backup_restore::untar::{SourceRemoval, UnTarFile, UntarError, UntarOptions};

use proxmox_router::cli::*;
use proxmox_schema::api;

fn engine_error(err: UntarError) -> Error {
    format_err!("{} (status {})", err, err.code())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name.",
            },
        },
    },
)]
/// List the regular files of an archive.
fn list_archive(archive: String) -> Result<(), Error> {
    let mut untar = UnTarFile::new();

    for entry in untar.entries(Path::new(&archive)).map_err(engine_error)? {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{} ({} bytes at {})", entry.path, entry.size, entry.data_offset);
        } else {
            log::info!("{}", entry.path);
        }
    }
    Ok(())
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name.",
            },
            target: {
                description: "Target directory",
                optional: true,
            },
            owner: {
                description: "Owner uid of the restored sandbox, 0 keeps the archived owners.",
                type: Integer,
                minimum: 0,
                optional: true,
            },
            "keep-source": {
                description: "Do not remove the archive after extraction.",
                optional: true,
                default: false,
            },
            "allow-traversal": {
                description: "Allow entry names containing '..' components.",
                optional: true,
                default: false,
            },
        },
    },
)]
/// Extract an archive.
fn extract_archive(
    archive: String,
    target: Option<String>,
    owner: Option<u32>,
    keep_source: bool,
    allow_traversal: bool,
) -> Result<(), Error> {
    let target = target.as_ref().map_or_else(|| ".", String::as_str);

    let options = UntarOptions {
        reject_path_traversal: !allow_traversal,
        source_removal: if keep_source {
            SourceRemoval::Never
        } else {
            SourceRemoval::Always
        },
        ..Default::default()
    };

    log::debug!("untar extract: {} to {}", archive, target);

    UnTarFile::with_options(options)
        .unpack(Path::new(&archive), Path::new(target), owner.unwrap_or(0))
        .map_err(engine_error)
}

#[api(
    input: {
        properties: {
            manifest: {
                description: "Split set manifest, listing '<chunk>|<size>' per line.",
            },
            target: {
                description: "Target directory",
                optional: true,
            },
            owner: {
                description: "Owner uid of the restored sandbox, 0 keeps the archived owners.",
                type: Integer,
                minimum: 0,
                optional: true,
            },
        },
    },
)]
/// Extract a split archive set. Extracted chunks are removed.
fn extract_split(
    manifest: String,
    target: Option<String>,
    owner: Option<u32>,
) -> Result<(), Error> {
    let target = target.as_ref().map_or_else(|| ".", String::as_str);

    UnTarFile::new()
        .unpack_split(Path::new(&manifest), Path::new(target), owner.unwrap_or(0))
        .map_err(engine_error)
}

#[api(
    input: {
        properties: {
            archive: {
                description: "Archive name.",
            },
            target: {
                description: "Target directory",
                optional: true,
            },
        },
    },
)]
/// Check whether an archive is part of a split set.
fn is_split(archive: String, target: Option<String>) -> Result<(), Error> {
    let target = target.as_ref().map_or_else(|| ".", String::as_str);

    let split = UnTarFile::new().is_split_archive(Path::new(&archive), Path::new(target));
    println!("{}", split);

    Ok(())
}

fn main() {
    init_cli_logger(restore_buildcfg::UNTAR_LOG_ENV, "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "list",
            CliCommand::new(&API_METHOD_LIST_ARCHIVE)
                .arg_param(&["archive"])
                .completion_cb("archive", complete_file_name),
        )
        .insert(
            "extract",
            CliCommand::new(&API_METHOD_EXTRACT_ARCHIVE)
                .arg_param(&["archive", "target"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("target", complete_file_name),
        )
        .insert(
            "extract-split",
            CliCommand::new(&API_METHOD_EXTRACT_SPLIT)
                .arg_param(&["manifest", "target"])
                .completion_cb("manifest", complete_file_name)
                .completion_cb("target", complete_file_name),
        )
        .insert(
            "is-split",
            CliCommand::new(&API_METHOD_IS_SPLIT)
                .arg_param(&["archive", "target"])
                .completion_cb("archive", complete_file_name)
                .completion_cb("target", complete_file_name),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
