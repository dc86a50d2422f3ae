//! 工具输出捕获与大输出溢出
//!
//! `ToolOutput` 同步追加到共享缓冲区，取消时可随时取到已写入的部分；
//! 同时每个流由一个转发任务把片段作为 Stream 事件发出。
//! 超过字节阈值的 stdout / stderr / 结果各自独立截断，完整内容写入溢出文件。

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::Emitter;

/// 工具写输出的句柄，可克隆
#[derive(Clone)]
pub struct ToolOutput {
    buf: Arc<Mutex<Vec<u8>>>,
    writes: Arc<AtomicUsize>,
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ToolOutput {
    /// 不转发事件的输出（测试或独立调用）
    pub fn detached() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(AtomicUsize::new(0)),
            tx: None,
        }
    }

    pub fn write(&self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        if let Ok(mut buf) = self.buf.lock() {
            buf.extend_from_slice(data);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(String::from_utf8_lossy(data).into_owned());
        }
    }

    pub fn write_line(&self, line: &str) {
        self.write(format!("{line}\n"));
    }

    /// 到目前为止写入的全部内容
    pub fn snapshot(&self) -> String {
        self.buf
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }

    /// write 被调用的次数
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

/// 创建一个输出流及其转发任务；所有 ToolOutput 克隆被 drop 后任务结束
pub(crate) fn capture(stream: &str, emitter: &Emitter) -> (ToolOutput, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let output = ToolOutput {
        buf: Arc::new(Mutex::new(Vec::new())),
        writes: Arc::new(AtomicUsize::new(0)),
        tx: Some(tx),
    };
    let emitter = emitter.clone();
    let stream = stream.to_string();
    let pump = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            emitter.stream(&stream, &chunk);
        }
    });
    (output, pump)
}

fn file_name_filter() -> Option<&'static Regex> {
    static FILTER: OnceLock<Option<Regex>> = OnceLock::new();
    FILTER
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").ok())
        .as_ref()
}

fn sanitize(name: &str) -> String {
    match file_name_filter() {
        Some(re) => re.replace_all(name, "_").into_owned(),
        None => name.to_string(),
    }
}

/// 按字节阈值截断，必要时写溢出文件
#[derive(Debug, Clone)]
pub struct OutputLimiter {
    limit: usize,
    spill_dir: PathBuf,
}

impl OutputLimiter {
    pub fn new(limit: usize, spill_dir: PathBuf) -> Self {
        Self { limit, spill_dir }
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit
    }

    /// 超过阈值时返回「前 limit 字节 + 溢出文件提示」，否则原样返回
    pub async fn apply(&self, call_tool_id: &str, label: &str, content: String) -> String {
        if content.len() <= self.limit {
            return content;
        }
        let total = content.len();
        let mut cut = self.limit;
        while cut > 0 && !content.is_char_boundary(cut) {
            cut -= 1;
        }
        let head = &content[..cut];

        let path = self
            .spill_dir
            .join(format!("{}_{}.txt", sanitize(call_tool_id), sanitize(label)));
        let written = match tokio::fs::create_dir_all(&self.spill_dir).await {
            Ok(()) => tokio::fs::write(&path, content.as_bytes()).await,
            Err(e) => Err(e),
        };
        let note = match written {
            Ok(()) => format!(
                "\n... [{label} truncated: {total} bytes total, full content saved in file: {}]",
                path.display()
            ),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to write spill file");
                format!("\n... [{label} truncated: {total} bytes total, spill file unavailable]")
            }
        };
        format!("{head}{note}")
    }
}
