//! 管理后台命令层
//!
//! 外部请求处理代码调用这里的函数，返回可直接序列化给模板的 DTO

pub mod package_cmd;
