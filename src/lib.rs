// unlock-remote-system
//
// 远程解锁 Debian/Ubuntu 主机的根文件系统加密：
// 识别主机当前处于预启动环境还是完整系统，把口令送入预启动环境，
// 并确认系统在限定时间内启动完成。

pub mod cli;
pub mod models;
pub mod reboot;
pub mod services;
pub mod ssh;
pub mod unlock;
