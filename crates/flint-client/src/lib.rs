#![deny(unsafe_code)]
#![doc = r#"
# flint-client

## 设计动机（Why）
- **定位**：面向文本分帧发布/订阅协议（flint 代理协议）的同步客户端核心，
  覆盖流式协议解析、连接状态机与重连引擎、订阅投递子系统、请求应答与
  冲刷协调四大耦合子系统。
- **架构角色**：作为应用与代理集群之间的唯一通道，向上提供
  发布/订阅/请求/冲刷/排空原语，向下封装套接字、TLS 与线协议细节。
- **设计理念**：共享可变状态以互斥锁与条件变量治理，单条连接锁守护
  状态机不变式；任何阻塞套接字写都发生在连接锁之外。

## 核心契约（What）
- **解析器可重启**：线协议可在任意字节断点被切分，跨调用续传产生的
  事件序列与一次性喂入完全一致；
- **重连透明**：断连期间订阅关系保持，重连后按升序 sid 回放，断连期的
  发布在受限缓冲内暂存并于重连后冲刷；
- **冲刷先行发生**：`flush` 成功返回时，之前的所有发布均已被服务器
  应答；
- **投递保序**：单个订阅内消息按服务器发送顺序投递，回调从不并发。

## 执行模型（How）
- 稳态每连接三条后台线程：读循环、flusher（`send_asap` 时省略）、
  心跳定时器；另有串行化用户回调的分发线程；
- 异步订阅默认每订阅一条投递线程，连接可选择共享库级投递池
  （[`init_delivery_pool`]）；
- 重连引擎在独立线程轮换服务器池，按服务器冷却、剪除超限的宣告端点。

## 权衡与风险（Trade-offs）
- 同步阻塞模型换取可审计的锁序（连接 → 订阅 → 投递池）与零运行时依赖；
- TLS 会话不可拆分读写半部，读侧以 50ms 有界读持锁，牺牲微量延迟换取
  写侧的及时插入；
- 连接需显式 [`Connection::close`] 回收线程，仅丢弃句柄不会终止后台
  线程。
"#]

mod buffer;
mod connection;
mod dispatch;
mod error;
mod inbox;
mod message;
mod options;
mod parser;
mod pool;
mod proto;
mod socket;
mod stats;
mod subscription;
mod url;

pub use connection::{Connection, Status};
pub use dispatch::{init_delivery_pool, set_delivery_pool_size, shutdown_delivery_pool};
pub use error::{Error, Result, codes};
pub use message::Message;
pub use options::{ConnHandler, ErrHandler, IpResolutionOrder, MessageHandler, Options, TlsPosture};
pub use stats::Statistics;
pub use subscription::Subscription;
pub use url::{DEFAULT_PORT, DEFAULT_SCHEME, ServerUrl};
