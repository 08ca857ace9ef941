//! 终端标定提示

use openk_client::CalibrationPrompt;
use openk_tools::CalibrationError;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 每隔多少个样本刷新一次进度
const PROGRESS_EVERY: u32 = 25;

/// 用 inquire 确认中位，回车结束扫描
pub struct InquirePrompt {
    joints: Vec<String>,
    finished: Arc<AtomicBool>,
}

impl InquirePrompt {
    pub fn new() -> Self {
        Self {
            joints: Vec::new(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CalibrationPrompt for InquirePrompt {
    fn wait_for_middle_pose(&mut self, arm_id: &str) -> Result<(), CalibrationError> {
        println!();
        println!("🦾 标定 '{}'：扭矩已关闭，请把所有关节摆到行程中间", arm_id);
        let confirmed = inquire::Confirm::new("已摆到中位？")
            .with_default(true)
            .prompt()
            .map_err(|e| CalibrationError::Aborted(e.to_string()))?;
        if !confirmed {
            return Err(CalibrationError::Aborted("operator declined middle pose".to_string()));
        }
        Ok(())
    }

    fn begin_sweep(&mut self, joints: &[String]) {
        self.joints = joints.to_vec();
        self.finished.store(false, Ordering::SeqCst);

        println!();
        println!("🔄 请依次把每个关节扫过全行程，完成后按回车");
        let finished = self.finished.clone();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            finished.store(true, Ordering::SeqCst);
        });
    }

    fn sweep_finished(&mut self, samples: u32, mins: &[f64], maxs: &[f64]) -> bool {
        let done = self.finished.load(Ordering::SeqCst);
        if done || samples % PROGRESS_EVERY == 0 {
            let spans = self
                .joints
                .iter()
                .zip(mins.iter().zip(maxs))
                .map(|(name, (min, max))| format!("{}={:.0}", name, max - min))
                .collect::<Vec<_>>()
                .join(" ");
            print!("\r   样本 {:>6} | 量程 {}", samples, spans);
            let _ = std::io::stdout().flush();
        }
        if done {
            println!();
        }
        done
    }
}
