use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "http-tunnel-broker")]
#[command(author, version, about = "HTTP reverse tunnel broker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行代理服务器
    Server {
        /// 配置文件路径（省略时使用默认配置）
        #[arg(short, long)]
        config: Option<String>,

        /// 覆盖监听端口
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// 运行隧道对端，把代理转发来的请求交给本地服务
    Agent {
        /// 配置文件路径
        #[arg(short, long, default_value = "agent.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成示例配置
    Template {
        /// 配置类型
        #[arg(value_parser = ["server", "agent"])]
        template_type: String,

        /// 输出文件路径（省略时打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
}
