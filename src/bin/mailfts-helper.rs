//! Reference text extraction helper for mailfts.
//!
//! Speaks the helper side of the line protocol on stdin/stdout: answers the
//! version handshake, then serves tagged `index` and `shadow` requests by
//! writing the extracted text next to the input as `<input>.txt`.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, anyhow, bail};
use env_logger::{Builder, Env};
use lazy_static::lazy_static;
use regex::Regex;

use mailfts::indexer::protocol::{PROTOCOL_VERSION, version_line};

/// Shortest run of printable bytes kept from binary input.
const MIN_PRINTABLE_RUN: usize = 4;

lazy_static! {
    static ref SCRIPT_OR_STYLE: Regex =
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").unwrap();
    static ref COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").unwrap();
    static ref BLANKS: Regex = Regex::new(r"[ \t\r\f]+").unwrap();
}

fn main() {
    Builder::from_env(Env::default().default_filter_or("warn"))
        .format(|buf, record| {
            writeln!(buf, "mailfts-helper[{}] {}", record.level(), record.args())
        })
        .init();

    if let Err(e) = serve(io::stdin().lock(), io::stdout().lock()) {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn serve<R: BufRead, W: Write>(input: R, mut output: W) -> anyhow::Result<()> {
    let mut lines = input.lines();

    let Some(first) = lines.next().transpose()? else {
        return Ok(());
    };
    match first.trim_end().strip_prefix("version ") {
        Some(version) if version == PROTOCOL_VERSION.to_string() => {}
        Some(version) => log::warn!("core speaks version {version}, answering with ours"),
        None => bail!("expected a version line, got {first:?}"),
    }
    writeln!(output, "{}", version_line())?;
    output.flush()?;

    for line in lines {
        let line = line?;
        let Some((tag, command)) = line.trim_end_matches('\r').split_once('\t') else {
            log::warn!("ignoring untagged line: {line:?}");
            continue;
        };
        match handle(command) {
            Ok(path) => writeln!(output, "{tag}\tOK\t{}", path.display())?,
            Err(e) => {
                log::warn!("{command}: {e:#}");
                writeln!(output, "{tag}\tERROR\t{}", one_line(&format!("{e:#}")))?
            }
        }
        output.flush()?;
    }
    Ok(())
}

fn handle(command: &str) -> anyhow::Result<PathBuf> {
    let (verb, args) = command.split_once(' ').unwrap_or((command, ""));
    match verb {
        "index" => {
            let (path, content_type) = args
                .rsplit_once(' ')
                .ok_or_else(|| anyhow!("index needs a path and a content type"))?;
            let data = fs::read(path).with_context(|| format!("reading {path}"))?;
            write_output(Path::new(path), &extract(&data, content_type))
        }
        "shadow" => {
            let (path, ids) = args
                .rsplit_once(" ids=")
                .ok_or_else(|| anyhow!("shadow needs a path and ids"))?;
            log::debug!("shadow over {} documents", ids.split(',').count());
            let marker = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            write_output(Path::new(path), &marker)
        }
        _ => bail!("unknown command {verb:?}"),
    }
}

fn write_output(input: &Path, text: &str) -> anyhow::Result<PathBuf> {
    let mut name = input.as_os_str().to_owned();
    name.push(".txt");
    let output = PathBuf::from(name);
    fs::write(&output, text).with_context(|| format!("writing {}", output.display()))?;
    Ok(output)
}

/// Text of a part, by content type.
fn extract(data: &[u8], content_type: &str) -> String {
    let content_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if content_type == "text/html" || content_type == "application/xhtml+xml" {
        strip_html(&String::from_utf8_lossy(data))
    } else if content_type.starts_with("text/") {
        String::from_utf8_lossy(data).into_owned()
    } else {
        printable_runs(data)
    }
}

fn strip_html(html: &str) -> String {
    let text = SCRIPT_OR_STYLE.replace_all(html, " ");
    let text = COMMENT.replace_all(&text, " ");
    let text = TAG.replace_all(&text, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    BLANKS.replace_all(&text, " ").trim().to_string()
}

/// Runs of printable ASCII, one per line, like `strings`.
fn printable_runs(data: &[u8]) -> String {
    data.split(|&b| !(b.is_ascii_graphic() || b == b' '))
        .filter(|run| run.len() >= MIN_PRINTABLE_RUN)
        .map(|run| String::from_utf8_lossy(run).trim().to_string())
        .filter(|run| !run.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn one_line(message: &str) -> String {
    message.replace(['\n', '\r', '\t'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_strip_html() {
        let html = "<html><style>p { color: red }</style><body><p>Hello&nbsp;<b>world</b></p>\
                    <!-- hidden --><script>var x;</script>&amp; more</body></html>";
        assert_eq!(strip_html(html), "Hello world & more");
    }

    #[test]
    fn test_printable_runs() {
        let data = b"%PDF-1.4\x00\x01\x02BT (quarterly report) Tj ET\x00ab\x00";
        assert_eq!(printable_runs(data), "%PDF-1.4\nBT (quarterly report) Tj ET");
    }

    #[test]
    fn test_extract_by_content_type() {
        assert_eq!(extract(b"<i>x y</i>", "text/html; charset=utf-8"), "x y");
        assert_eq!(extract(b"<i>x y</i>", "text/plain"), "<i>x y</i>");
    }

    #[test]
    fn test_serve_session() {
        let dir = TempDir::new().unwrap();
        let spill = dir.path().join("101.body.1.abc.spill");
        fs::write(&spill, b"%PDF-1.4\x00(quarterly report)").unwrap();

        let input = format!(
            "version 1\nnot tagged\nt1\tindex {} application/pdf\nt2\tfrobnicate\n",
            spill.display()
        );
        let mut output = Vec::new();
        serve(input.as_bytes(), &mut output).unwrap();
        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        let expected = format!("{}.txt", spill.display());
        assert_eq!(lines[0], "version 1");
        assert_eq!(lines[1], format!("t1\tOK\t{expected}"));
        assert!(lines[2].starts_with("t2\tERROR\t"));
        assert_eq!(
            fs::read_to_string(expected).unwrap(),
            "%PDF-1.4\n(quarterly report)"
        );
    }

    #[test]
    fn test_missing_input_is_an_error_reply() {
        let mut output = Vec::new();
        serve(
            "version 1\nt\tindex /no/such/file.spill text/plain\n".as_bytes(),
            &mut output,
        )
        .unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.lines().nth(1).unwrap().starts_with("t\tERROR\t"));
    }
}
