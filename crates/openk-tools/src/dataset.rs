//! # 数据集格式
//!
//! 目录布局：
//!
//! ```text
//! <root>/
//!   meta.json                    # schema、帧率、片段索引
//!   episodes/episode_000000.bin  # 每个已封存片段一个文件
//! ```
//!
//! 片段文件格式：
//!
//! ```text
//! [MAGIC: 8 bytes]
//! [Version: 1 byte]
//! [Data: bincode serialized Episode]
//! ```
//!
//! 所有写入都先写临时文件再 rename，中途崩溃不会留下半个片段。

use crate::episode::{Episode, FeatureSchema};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 片段文件魔数
pub const MAGIC: &[u8; 8] = b"OPENKEPI";

/// 片段文件格式版本
pub const FORMAT_VERSION: u8 = 1;

pub const META_FILE: &str = "meta.json";
pub const EPISODES_DIR: &str = "episodes";

/// 片段文件名：`episode_NNNNNN.bin`
pub fn episode_file_name(index: u32) -> String {
    format!("episode_{:06}.bin", index)
}

/// 保存单个片段文件
pub fn save_episode<P: AsRef<Path>>(path: P, episode: &Episode) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("bin.tmp");
    {
        let file = File::create(&tmp).context("创建片段文件失败")?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC).context("写入魔数失败")?;
        writer.write_all(&[FORMAT_VERSION]).context("写入版本失败")?;

        let data = bincode::serialize(episode).context("序列化片段失败")?;
        writer.write_all(&data).context("写入片段数据失败")?;

        let file = writer.into_inner().context("刷新缓冲区失败")?;
        file.sync_all().context("同步片段文件失败")?;
    }
    fs::rename(&tmp, path).context("重命名片段文件失败")?;
    Ok(())
}

/// 加载单个片段文件
pub fn load_episode<P: AsRef<Path>>(path: P) -> Result<Episode> {
    let file = File::open(path.as_ref()).context("打开片段文件失败")?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).context("读取魔数失败")?;
    if &magic != MAGIC {
        anyhow::bail!("无效的片段文件格式（魔数不匹配）");
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version).context("读取版本失败")?;
    if version[0] != FORMAT_VERSION {
        anyhow::bail!("不支持的片段文件版本: {}", version[0]);
    }

    let mut data = Vec::new();
    reader.read_to_end(&mut data).context("读取片段数据失败")?;
    let episode: Episode = bincode::deserialize(&data).context("反序列化片段失败")?;
    Ok(episode)
}

// ============================================================================
// 元数据
// ============================================================================

/// 片段索引条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub index: u32,
    pub task: String,
    pub fps: f64,
    /// 帧数
    pub length: usize,
}

/// `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub format_version: u8,
    /// 数据集帧率，所有片段相同
    pub fps: f64,
    /// 第一次写入片段时确定
    pub schema: Option<FeatureSchema>,
    /// 按序号升序
    pub episodes: Vec<EpisodeSummary>,
    /// 创建时间（Unix 时间戳，秒）
    pub created_at: u64,
}

impl DatasetMeta {
    pub fn new(fps: f64) -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        Self {
            format_version: FORMAT_VERSION,
            fps,
            schema: None,
            episodes: Vec::new(),
            created_at: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.episodes.iter().map(|e| e.length).sum()
    }
}

// ============================================================================
// 数据集
// ============================================================================

/// 磁盘上的数据集
#[derive(Debug)]
pub struct Dataset {
    root: PathBuf,
    meta: DatasetMeta,
}

impl Dataset {
    /// 创建新数据集；目录中已有 `meta.json` 时失败
    pub fn create<P: AsRef<Path>>(root: P, fps: f64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !(fps.is_finite() && fps > 0.0) {
            anyhow::bail!("数据集帧率必须为正数: {}", fps);
        }
        if root.join(META_FILE).exists() {
            anyhow::bail!("数据集已存在: {}", root.display());
        }
        fs::create_dir_all(root.join(EPISODES_DIR)).context("创建数据集目录失败")?;

        let dataset = Self {
            root,
            meta: DatasetMeta::new(fps),
        };
        dataset.save_meta()?;
        info!("Created dataset at {} ({} fps)", dataset.root.display(), fps);
        Ok(dataset)
    }

    /// 打开已有数据集
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta_path = root.join(META_FILE);
        let content = fs::read_to_string(&meta_path)
            .with_context(|| format!("读取数据集元数据失败: {}", meta_path.display()))?;
        let mut meta: DatasetMeta = serde_json::from_str(&content).context("解析数据集元数据失败")?;
        if meta.format_version != FORMAT_VERSION {
            anyhow::bail!("不支持的数据集版本: {}", meta.format_version);
        }
        meta.episodes.sort_by_key(|e| e.index);
        debug!(
            "Opened dataset at {} ({} episodes, {} frames)",
            root.display(),
            meta.episodes.len(),
            meta.total_frames()
        );
        Ok(Self { root, meta })
    }

    /// 打开或创建；已有数据集的帧率必须一致
    pub fn open_or_create<P: AsRef<Path>>(root: P, fps: f64) -> Result<Self> {
        let root = root.as_ref();
        if !root.join(META_FILE).exists() {
            return Self::create(root, fps);
        }
        let dataset = Self::open(root)?;
        if (dataset.meta.fps - fps).abs() > f64::EPSILON {
            anyhow::bail!(
                "数据集帧率为 {} fps，与请求的 {} fps 不一致",
                dataset.meta.fps,
                fps
            );
        }
        Ok(dataset)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    pub fn fps(&self) -> f64 {
        self.meta.fps
    }

    pub fn schema(&self) -> Option<&FeatureSchema> {
        self.meta.schema.as_ref()
    }

    pub fn episodes(&self) -> &[EpisodeSummary] {
        &self.meta.episodes
    }

    pub fn len(&self) -> usize {
        self.meta.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.episodes.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.meta.episodes.iter().any(|e| e.index == index)
    }

    /// 下一个片段序号：已有最大序号 + 1（空数据集为 0）
    pub fn next_episode_index(&self) -> u32 {
        self.meta.episodes.iter().map(|e| e.index + 1).max().unwrap_or(0)
    }

    /// 检查能否从 `from` 继续录制
    ///
    /// `from` 必须正好是已有最大序号之后的那个序号，既不覆盖也不留空洞。
    pub fn check_resume(&self, from: u32) -> Result<()> {
        let next = self.next_episode_index();
        if from < next {
            anyhow::bail!("片段 {} 已存在，继续录制会覆盖（下一个可用序号为 {}）", from, next);
        }
        if from > next {
            anyhow::bail!("从片段 {} 继续会留下空洞（下一个可用序号为 {}）", from, next);
        }
        Ok(())
    }

    pub fn episode_path(&self, index: u32) -> PathBuf {
        self.root.join(EPISODES_DIR).join(episode_file_name(index))
    }

    /// 确定或校验 schema
    pub fn ensure_schema(&mut self, schema: &FeatureSchema) -> Result<()> {
        match &self.meta.schema {
            Some(existing) if !existing.same_shape(schema) => {
                anyhow::bail!(
                    "数据集 schema 不一致: 已有 {:?}/{:?}，新的 {:?}/{:?}",
                    existing.observation,
                    existing.action,
                    schema.observation,
                    schema.action
                );
            },
            Some(_) => Ok(()),
            None => {
                self.meta.schema = Some(schema.clone());
                self.save_meta()
            },
        }
    }

    /// 写入已封存片段，并更新 `meta.json`
    pub fn write_episode(&mut self, episode: &Episode) -> Result<PathBuf> {
        if self.contains(episode.index) {
            anyhow::bail!("片段 {} 已存在", episode.index);
        }
        if (episode.fps - self.meta.fps).abs() > f64::EPSILON {
            anyhow::bail!(
                "片段帧率 {} fps 与数据集帧率 {} fps 不一致",
                episode.fps,
                self.meta.fps
            );
        }
        episode.check_contiguous()?;
        if let Some(schema) = &self.meta.schema {
            for frame in &episode.frames {
                schema.check(&frame.observation, &frame.action)?;
            }
        }

        let path = self.episode_path(episode.index);
        fs::create_dir_all(self.root.join(EPISODES_DIR)).context("创建片段目录失败")?;
        save_episode(&path, episode)?;

        self.meta.episodes.push(EpisodeSummary {
            index: episode.index,
            task: episode.task.clone(),
            fps: episode.fps,
            length: episode.len(),
        });
        self.meta.episodes.sort_by_key(|e| e.index);
        self.save_meta()?;

        info!(
            "Episode {} written to {} ({} frames)",
            episode.index,
            path.display(),
            episode.len()
        );
        Ok(path)
    }

    /// 加载片段；序号必须在索引中
    pub fn load_episode(&self, index: u32) -> Result<Episode> {
        if !self.contains(index) {
            anyhow::bail!("数据集中没有片段 {}", index);
        }
        let path = self.episode_path(index);
        let episode = load_episode(&path).with_context(|| format!("加载片段失败: {}", path.display()))?;
        if episode.index != index {
            anyhow::bail!("片段文件 {} 的序号为 {}", path.display(), episode.index);
        }
        Ok(episode)
    }

    fn save_meta(&self) -> Result<()> {
        let path = self.root.join(META_FILE);
        let tmp = self.root.join(format!("{}.tmp", META_FILE));
        let json = serde_json::to_string_pretty(&self.meta).context("序列化元数据失败")?;
        fs::write(&tmp, json).context("写入元数据失败")?;
        fs::rename(&tmp, &path).context("重命名元数据失败")?;
        Ok(())
    }
}
