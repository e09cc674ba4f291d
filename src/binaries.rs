use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use itertools::Itertools;
use log::debug;

use crate::extfs::disk::unit_bytes;
use crate::extfs::kernel::{Errno, FileSource, Kernel};
use crate::extfs::partition::DeleteMode;
use crate::extfs::report::ReportKind;
use crate::extfs::structs::{Fit, TYPE_EXTENDED, TYPE_LOGICAL, TYPE_PRIMARY};
use crate::util::human_time;

#[derive(Debug, Parser)]
#[clap(no_binary_name = true, disable_help_subcommand = true)]
struct CommandLine {
  #[clap(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  Mkdisk {
    #[clap(long)]
    size: i64,
    #[clap(long, default_value = "M")]
    unit: String,
    #[clap(long, default_value = "FF")]
    fit: String,
    #[clap(long)]
    path: PathBuf,
  },
  Rmdisk {
    #[clap(long)]
    path: PathBuf,
  },
  Fdisk {
    #[clap(long, allow_hyphen_values = true)]
    size: Option<i64>,
    #[clap(long, default_value = "K")]
    unit: String,
    #[clap(long)]
    path: PathBuf,
    #[clap(long = "type", default_value = "P")]
    kind: String,
    #[clap(long, default_value = "WF")]
    fit: String,
    #[clap(long)]
    name: String,
    #[clap(long)]
    delete: Option<String>,
    #[clap(long, allow_hyphen_values = true)]
    add: Option<i64>,
  },
  Mount {
    #[clap(long)]
    path: PathBuf,
    #[clap(long)]
    name: String,
  },
  Mounted,
  Unmount {
    #[clap(long)]
    id: String,
  },
  Mkfs {
    #[clap(long)]
    id: String,
    #[clap(long = "type", default_value = "full")]
    kind: String,
    #[clap(long, default_value = "2fs")]
    fs: String,
  },
  Login {
    #[clap(long)]
    user: String,
    #[clap(long)]
    pass: String,
    #[clap(long)]
    id: String,
  },
  Logout,
  Mkgrp {
    #[clap(long)]
    name: String,
  },
  Rmgrp {
    #[clap(long)]
    name: String,
  },
  Mkusr {
    #[clap(long)]
    user: String,
    #[clap(long)]
    pass: String,
    #[clap(long)]
    grp: String,
  },
  Rmusr {
    #[clap(long)]
    user: String,
  },
  Chgrp {
    #[clap(long)]
    user: String,
    #[clap(long)]
    grp: String,
  },
  Mkfile {
    #[clap(long)]
    path: String,
    #[clap(long = "r")]
    parents: bool,
    #[clap(long, allow_hyphen_values = true)]
    size: Option<i64>,
    #[clap(long)]
    cont: Option<PathBuf>,
  },
  Mkdir {
    #[clap(long)]
    path: String,
    #[clap(long = "p")]
    parents: bool,
  },
  Cat {
    #[clap(long)]
    file1: Option<String>,
    #[clap(long)]
    file2: Option<String>,
    #[clap(long)]
    file3: Option<String>,
    #[clap(long)]
    file4: Option<String>,
    #[clap(long)]
    file5: Option<String>,
    #[clap(long)]
    file6: Option<String>,
    #[clap(long)]
    file7: Option<String>,
    #[clap(long)]
    file8: Option<String>,
    #[clap(long)]
    file9: Option<String>,
    #[clap(long)]
    file10: Option<String>,
  },
  Remove {
    #[clap(long)]
    path: String,
  },
  Edit {
    #[clap(long)]
    path: String,
    #[clap(long)]
    contenido: PathBuf,
  },
  Rename {
    #[clap(long)]
    path: String,
    #[clap(long)]
    name: String,
  },
  Copy {
    #[clap(long)]
    path: String,
    #[clap(long)]
    destino: String,
  },
  Move {
    #[clap(long)]
    path: String,
    #[clap(long)]
    destino: String,
  },
  Find {
    #[clap(long)]
    path: String,
    #[clap(long)]
    name: String,
  },
  Chown {
    #[clap(long)]
    path: String,
    #[clap(long = "r")]
    recursive: bool,
    #[clap(long)]
    usuario: String,
  },
  Chmod {
    #[clap(long)]
    path: String,
    #[clap(long = "r")]
    recursive: bool,
    #[clap(long)]
    ugo: String,
  },
  Recovery {
    #[clap(long)]
    id: String,
  },
  Loss {
    #[clap(long)]
    id: String,
  },
  Journaling {
    #[clap(long)]
    id: String,
    #[clap(long)]
    dump: bool,
  },
  Repair {
    #[clap(long)]
    id: String,
  },
  Rep {
    #[clap(long)]
    name: String,
    #[clap(long)]
    path: PathBuf,
    #[clap(long)]
    id: Option<String>,
    #[clap(long)]
    disk: Option<PathBuf>,
    #[clap(long = "path_file_ls")]
    path_file_ls: Option<String>,
  },
}

/// Split a line into words. Double quotes group words and `#` outside
/// quotes starts a comment.
pub fn tokenize(line: &str) -> Result<Vec<String>, Errno> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  let mut quoted = false;
  let mut pending = false;

  for character in line.chars() {
    match character {
      '"' => {
        quoted = !quoted;
        pending = true;
      }
      '#' if !quoted => break,
      character if character.is_whitespace() && !quoted => {
        if pending {
          tokens.push(std::mem::take(&mut current));
          pending = false;
        }
      }
      character => {
        current.push(character);
        pending = true;
      }
    }
  }
  if quoted {
    return Err(Errno::EINVAL(String::from("unterminated quote")));
  }
  if pending {
    tokens.push(current);
  }
  Ok(tokens)
}

/// `-Key=value` to `--key=value`, and the command name lowercased.
fn normalize_args(tokens: Vec<String>) -> Vec<String> {
  tokens
    .into_iter()
    .enumerate()
    .map(|(index, token)| {
      if index == 0 {
        return token.to_ascii_lowercase();
      }
      let is_option = token.starts_with('-')
        && !token.starts_with("--")
        && token[1..].chars().next().map_or(false, |character| character.is_ascii_alphabetic());
      if !is_option {
        return token;
      }
      match token[1..].split_once('=') {
        Some((key, value)) => format!("--{}={value}", key.to_ascii_lowercase()),
        None => format!("--{}", token[1..].to_ascii_lowercase()),
      }
    })
    .collect()
}

fn parse(line: &str) -> Result<Option<Command>, Errno> {
  let tokens = normalize_args(tokenize(line)?);
  if tokens.is_empty() {
    return Ok(None);
  }
  debug!("command: {tokens:?}");
  CommandLine::try_parse_from(tokens.iter())
    .map(|parsed| Some(parsed.command))
    .map_err(|error| Errno::EINVAL(error.to_string().trim_end().to_owned()))
}

fn partition_type(kind: &str) -> Result<u8, Errno> {
  match kind.to_ascii_lowercase().as_str() {
    "p" | "primaria" | "primary" => Ok(TYPE_PRIMARY),
    "e" | "extendida" | "extended" => Ok(TYPE_EXTENDED),
    "l" | "logica" | "logical" => Ok(TYPE_LOGICAL),
    _ => Err(Errno::EINVAL(format!("invalid partition type '{kind}': expected P, E or L"))),
  }
}

/// Run one command line. Blank and comment-only lines print nothing.
pub fn execute(kernel: &mut Kernel, line: &str) -> Result<String, Errno> {
  let command = match parse(line)? {
    Some(command) => command,
    None => return Ok(String::new()),
  };

  let output = match command {
    Command::Mkdisk { size, unit, fit, path } => {
      let bytes = unit_bytes(size, &unit, false)?;
      let mbr = kernel.mkdisk(&path, bytes, Fit::parse(&fit)?)?;
      format!("mkdisk: created {} ({} bytes)", path.display(), mbr.size)
    }
    Command::Rmdisk { path } => {
      kernel.rmdisk(&path)?;
      format!("rmdisk: removed {}", path.display())
    }
    Command::Fdisk { size, unit, path, kind, fit, name, delete, add } => {
      if let Some(mode) = delete {
        kernel.fdisk_delete(&path, &name, DeleteMode::parse(&mode)?)?;
        format!("fdisk: deleted partition '{name}' ({})", mode.to_ascii_lowercase())
      } else if let Some(add) = add {
        let size = kernel.fdisk_add(&path, &name, unit_bytes(add, &unit, true)?)?;
        format!("fdisk: partition '{name}' is now {size} bytes")
      } else {
        let size = size.ok_or_else(|| Errno::EINVAL(String::from("fdisk: -size is required to create a partition")))?;
        if size <= 0 {
          return Err(Errno::EINVAL(format!("fdisk: -size must be positive, got {size}")));
        }
        let located = kernel.fdisk_create(
          &path,
          &name,
          unit_bytes(size, &unit, true)?,
          partition_type(&kind)?,
          Fit::parse(&fit)?,
        )?;
        format!(
          "fdisk: created {} partition '{name}' at {} ({} bytes)",
          located.r#type as char, located.start, located.size
        )
      }
    }
    Command::Mount { path, name } => {
      let mounted = kernel.mount(&path, &name)?;
      format!("mount: '{name}' of {} mounted as {}", path.display(), mounted.id)
    }
    Command::Mounted => {
      let mounted = kernel.get_mounted_partitions();
      if mounted.is_empty() {
        String::from("mounted: no partitions mounted")
      } else {
        mounted
          .iter()
          .map(|mounted| format!("{}\t{}\t{}", mounted.id, mounted.path.display(), mounted.name))
          .join("\n")
      }
    }
    Command::Unmount { id } => {
      let mounted = kernel.unmount(&id)?;
      format!("unmount: {} ('{}') unmounted", mounted.id, mounted.name)
    }
    Command::Mkfs { id, kind, fs } => {
      if !kind.eq_ignore_ascii_case("full") {
        return Err(Errno::EINVAL(format!("mkfs: unsupported -type '{kind}', only full")));
      }
      kernel.mkfs(&id, &fs)?;
      format!("mkfs: {id} formatted as {}", fs.to_ascii_lowercase())
    }
    Command::Login { user, pass, id } => {
      let session = kernel.login(&user, &pass, &id)?;
      format!("login: welcome {} ({})", session.user, session.partition_id)
    }
    Command::Logout => {
      let session = kernel.logout()?;
      format!("logout: bye {}", session.user)
    }
    Command::Mkgrp { name } => {
      let gid = kernel.mkgrp(&name)?;
      format!("mkgrp: group '{name}' created with gid {gid}")
    }
    Command::Rmgrp { name } => {
      kernel.rmgrp(&name)?;
      format!("rmgrp: group '{name}' removed")
    }
    Command::Mkusr { user, pass, grp } => {
      let uid = kernel.mkusr(&user, &pass, &grp)?;
      format!("mkusr: user '{user}' created with uid {uid}")
    }
    Command::Rmusr { user } => {
      kernel.rmusr(&user)?;
      format!("rmusr: user '{user}' removed")
    }
    Command::Chgrp { user, grp } => {
      kernel.chgrp(&user, &grp)?;
      format!("chgrp: '{user}' moved to '{grp}'")
    }
    Command::Mkfile { path, parents, size, cont } => {
      let source = match (cont, size) {
        (Some(host), _) => FileSource::Host(host),
        (None, Some(size)) => FileSource::Size(size),
        (None, None) => FileSource::Empty,
      };
      kernel.mkfile(&path, parents, &source)?;
      format!("mkfile: created {path}")
    }
    Command::Mkdir { path, parents } => {
      kernel.mkdir(&path, parents)?;
      format!("mkdir: created {path}")
    }
    Command::Cat { file1, file2, file3, file4, file5, file6, file7, file8, file9, file10 } => {
      let files: Vec<String> = [file1, file2, file3, file4, file5, file6, file7, file8, file9, file10]
        .into_iter()
        .flatten()
        .collect();
      kernel.cat(&files)?
    }
    Command::Remove { path } => {
      kernel.remove(&path)?;
      format!("remove: removed {path}")
    }
    Command::Edit { path, contenido } => {
      kernel.edit(&path, &contenido)?;
      format!("edit: {path} updated")
    }
    Command::Rename { path, name } => {
      kernel.rename(&path, &name)?;
      format!("rename: {path} renamed to {name}")
    }
    Command::Copy { path, destino } => {
      kernel.copy(&path, &destino)?;
      format!("copy: {path} copied into {destino}")
    }
    Command::Move { path, destino } => {
      kernel.move_to(&path, &destino)?;
      format!("move: {path} moved into {destino}")
    }
    Command::Find { path, name } => {
      let found = kernel.find(&path, &name)?;
      if found.is_empty() {
        format!("find: nothing matches '{name}' under {path}")
      } else {
        found.join("\n")
      }
    }
    Command::Chown { path, recursive, usuario } => {
      kernel.chown(&path, &usuario, recursive)?;
      format!("chown: {path} now belongs to {usuario}")
    }
    Command::Chmod { path, recursive, ugo } => {
      kernel.chmod(&path, &ugo, recursive)?;
      format!("chmod: {path} set to {ugo}")
    }
    Command::Recovery { id } => {
      let applied = kernel.recovery(&id)?;
      format!("recovery: {id} rebuilt from {applied} journal entries")
    }
    Command::Loss { id } => {
      kernel.loss(&id)?;
      format!("loss: {id} data region wiped")
    }
    Command::Journaling { id, dump } => {
      let mut output = journal_table(kernel, &id)?;
      if dump {
        output.push('\n');
        output.push_str(kernel.dump_journal_regions(&id)?.summary().trim_end());
      }
      output
    }
    Command::Repair { id } => {
      let kept = kernel.repair_journal(&id)?;
      format!("repair: {kept} journal entries kept")
    }
    Command::Rep { name, path, id, disk, path_file_ls } => {
      let kind = ReportKind::parse(&name)?;
      kernel.report(kind, &path, id.as_deref(), disk.as_deref(), path_file_ls.as_deref())?;
      format!("rep: {} written to {}", name.to_ascii_lowercase(), path.display())
    }
  };
  Ok(output)
}

fn journal_table(kernel: &Kernel, id: &str) -> Result<String, Errno> {
  let entries = kernel.get_journal(id)?;
  let mut table = format!("{:>5}  {:<10} {:<32} {:<20} {}", "count", "operation", "path", "date", "content");
  for entry in &entries {
    let _ = write!(
      table,
      "\n{:>5}  {:<10} {:<32} {:<20} {}",
      entry.count,
      entry.operation(),
      entry.path(),
      human_time(entry.date as i64),
      entry.content().escape_debug()
    );
  }
  if entries.is_empty() {
    table.push_str("\n(empty)");
  }
  Ok(table)
}

/// Run every line of a script, echoing each command before its output.
/// Failures are reported and the script goes on.
pub fn execute_script(kernel: &mut Kernel, script: &str) -> String {
  let mut transcript = String::new();
  for line in script.lines() {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }
    if trimmed.starts_with('#') {
      let _ = writeln!(transcript, "{trimmed}");
      continue;
    }
    let _ = writeln!(transcript, "# {trimmed}");
    match execute(kernel, trimmed) {
      Ok(output) if output.is_empty() => {}
      Ok(output) => {
        let _ = writeln!(transcript, "{output}");
      }
      Err(errno) => {
        let _ = writeln!(transcript, "error: {errno}");
      }
    }
  }
  transcript
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::machine::MachineConfig;
  use crate::util::mktemp;

  fn kernel() -> Kernel {
    Kernel::new(MachineConfig::default()).unwrap()
  }

  #[test]
  fn tokenize_quotes_and_comments() {
    assert_eq!(
      tokenize(r#"mkdir -path="/my docs/a" -p # trailing"#).unwrap(),
      vec!["mkdir", "-path=/my docs/a", "-p"]
    );
    assert_eq!(tokenize("   # only a comment").unwrap(), Vec::<String>::new());
    assert_eq!(tokenize(r#"cat -file1="a#b""#).unwrap(), vec!["cat", "-file1=a#b"]);
    assert!(tokenize(r#"mkdir -path="/x"#).is_err());
  }

  #[test]
  fn args_are_rewritten_for_clap() {
    let tokens = normalize_args(vec![
      String::from("MKDISK"),
      String::from("-Size=3"),
      String::from("-p"),
      String::from("-5"),
      String::from("-path=/A/B"),
    ]);
    assert_eq!(tokens, vec!["mkdisk", "--size=3", "--p", "-5", "--path=/A/B"]);
  }

  #[test]
  fn parsing_errors_are_einval() {
    assert!(matches!(parse("frobnicate -x=1"), Err(Errno::EINVAL(_))));
    assert!(matches!(parse("mkdisk -unit=K"), Err(Errno::EINVAL(_))));
    assert!(parse("").unwrap().is_none());
    assert!(matches!(parse("Mounted").unwrap(), Some(Command::Mounted)));
    match parse("fdisk -add=-500 -unit=b -path=/d -name=p").unwrap() {
      Some(Command::Fdisk { add, unit, kind, fit, .. }) => {
        assert_eq!(add, Some(-500));
        assert_eq!(unit, "b");
        assert_eq!((kind.as_str(), fit.as_str()), ("P", "WF"));
      }
      other => panic!("unexpected parse {other:?}"),
    }
  }

  #[test]
  fn partition_types() {
    assert_eq!(partition_type("e").unwrap(), TYPE_EXTENDED);
    assert_eq!(partition_type("Primaria").unwrap(), TYPE_PRIMARY);
    assert!(partition_type("x").is_err());
  }

  #[test]
  fn script_runs_the_scenarios() {
    let dir = mktemp();
    let disk = dir.join("d.mia");
    let host = dir.join("host.txt");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(&host, "edited").unwrap();
    let mut kernel = kernel();

    let setup = format!(
      "mkdisk -size=10 -unit=M -fit=FF -path={disk}\n\
       fdisk -type=P -size=5 -unit=M -name=p1 -fit=FF -path={disk}\n\
       mount -path={disk} -name=p1\n\
       mkfs -id=531A -fs=3fs\n",
      disk = disk.display()
    );
    let transcript = execute_script(&mut kernel, &setup);
    assert!(!transcript.contains("error:"), "{transcript}");
    assert_eq!(std::fs::metadata(&disk).unwrap().len(), 10_485_760);

    assert!(matches!(execute(&mut kernel, "mkdir -path=/a"), Err(Errno::EPERM(_))));
    execute(&mut kernel, "login -user=root -pass=123 -id=531a").unwrap();
    execute(&mut kernel, "mkgrp -name=devs").unwrap();
    execute(&mut kernel, "mkusr -user=alice -pass=abc -grp=devs").unwrap();
    let users = execute(&mut kernel, "cat -file1=/users.txt").unwrap();
    assert!(users.ends_with("2,G,devs\n2,U,devs,alice,abc\n"));

    execute(&mut kernel, "mkdir -path=/a/b/c -p").unwrap();
    execute(&mut kernel, "mkfile -path=/a/b/c/f.txt -size=20").unwrap();
    assert_eq!(execute(&mut kernel, "cat -file1=/a/b/c/f.txt").unwrap(), "01234567890123456789");

    execute(&mut kernel, &format!("edit -path=/a/b/c/f.txt -contenido={}", host.display())).unwrap();
    assert_eq!(execute(&mut kernel, "cat -file1=/a/b/c/f.txt").unwrap(), "edited");
    assert_eq!(execute(&mut kernel, "find -path=/ -name=f.*").unwrap(), "/a/b/c/f.txt");

    let journal = execute(&mut kernel, "journaling -id=531A").unwrap();
    assert!(journal.contains("mkusr"));
    assert!(journal.contains("edit"));

    execute(&mut kernel, "loss -id=531A").unwrap();
    assert!(execute(&mut kernel, "recovery -id=531A").unwrap().contains("5 journal entries"));
    assert_eq!(execute(&mut kernel, "cat -file1=/a/b/c/f.txt").unwrap(), "edited");

    let report = dir.join("tree.yaml");
    execute(&mut kernel, &format!("rep -id=531A -name=tree -path={}", report.display())).unwrap();
    assert!(report.is_file());

    let before = std::fs::read(&disk).unwrap();
    let delete = format!("fdisk -delete=full -name=p1 -path={}", disk.display());
    assert!(matches!(execute(&mut kernel, &delete), Err(Errno::EBUSY(_))));
    assert_eq!(std::fs::read(&disk).unwrap(), before);

    std::fs::remove_dir_all(dir).unwrap();
  }

  #[test]
  fn script_keeps_going_after_errors() {
    let mut kernel = kernel();
    let transcript = execute_script(&mut kernel, "# setup\nunmount -id=999Z\nmounted\n");
    assert!(transcript.starts_with("# setup\n# unmount -id=999Z\nerror: ENOENT"));
    assert!(transcript.ends_with("# mounted\nmounted: no partitions mounted\n"));
  }
}

// vim:ts=2 sw=2
