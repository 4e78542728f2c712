// autostart.rs — 登录时自动启动
// 写入/删除 XDG autostart 目录下的 .desktop 文件

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const ENTRY_NAME: &str = "wallart.desktop";

pub struct Autostart {
    entry_path: PathBuf,
    exe: PathBuf,
}

impl Autostart {
    pub fn new(autostart_dir: &Path, exe: impl Into<PathBuf>) -> Self {
        Self {
            entry_path: autostart_dir.join(ENTRY_NAME),
            exe: exe.into(),
        }
    }

    /// 使用当前可执行文件路径
    pub fn for_current_exe(autostart_dir: &Path) -> io::Result<Self> {
        Ok(Self::new(autostart_dir, std::env::current_exe()?))
    }

    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    pub fn is_enabled(&self) -> bool {
        self.entry_path.is_file()
    }

    /// 按配置开启或关闭
    pub fn apply(&self, enabled: bool) -> io::Result<()> {
        if enabled { self.enable() } else { self.disable() }
    }

    pub fn enable(&self) -> io::Result<()> {
        if let Some(dir) = self.entry_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.entry_path, self.desktop_entry())?;
        tracing::info!(path = %self.entry_path.display(), "autostart enabled");
        Ok(())
    }

    pub fn disable(&self) -> io::Result<()> {
        match fs::remove_file(&self.entry_path) {
            Ok(()) => {
                tracing::info!(path = %self.entry_path.display(), "autostart disabled");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn desktop_entry(&self) -> String {
        // Exec 字段里的路径含空格时需要加引号
        let exe = self.exe.display().to_string();
        let exe = if exe.contains(' ') {
            format!("\"{}\"", exe.replace('"', "\\\""))
        } else {
            exe
        };

        format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Name=wallart\n\
             Comment=Rotate museum artworks as desktop wallpaper\n\
             Exec={exe} daemon --autostart\n\
             Terminal=false\n\
             X-GNOME-Autostart-enabled=true\n"
        )
    }
}
