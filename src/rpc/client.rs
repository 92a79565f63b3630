use ethers::prelude::*;

pub type WsClient = Provider<Ws>;
pub type SignedClient = SignerMiddleware<Provider<Ws>, LocalWallet>;
