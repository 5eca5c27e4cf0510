use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use kubetail_k8s::{
    ApiSource, Counter, KubeClient, QueryScope, ResourceWatchReconciler, WatchableCollection,
};

use crate::client::ConnectArgs;

const PAGE_LIMIT: u32 = 100;

#[derive(clap::Args, Debug)]
pub struct PodsArgs {
    /// Namespace to watch, all namespaces when omitted
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Label selector
    #[arg(short = 'l', long)]
    pub selector: Option<String>,

    /// Print only the number of pods
    #[arg(long)]
    pub count: bool,
}

/// `kubetail contexts`
pub fn contexts() -> Result<()> {
    let client = KubeClient::from_kubeconfig()?;
    for ctx in client.get_contexts() {
        let marker = if ctx.is_current { "*" } else { " " };
        println!(
            "{} {:<32} {:<32} {}",
            marker,
            ctx.name,
            ctx.cluster,
            ctx.namespace.as_deref().unwrap_or("default")
        );
    }
    Ok(())
}

/// `kubetail pods`: keep a live pod list and print it on every change
pub async fn pods(connect: &ConnectArgs, args: PodsArgs) -> Result<()> {
    let client = connect.kube_client().await?;
    let api: Api<Pod> = match &args.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let source = ApiSource::new(
        api,
        QueryScope {
            label_selector: args.selector.clone(),
            page_limit: Some(PAGE_LIMIT),
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    if args.count {
        let (reconciler, updates) =
            ResourceWatchReconciler::<Pod, _, _>::new(source, Counter::new());
        tokio::spawn(reconciler.run(cancel.clone()));
        print_updates(updates, &cancel, |counter| {
            counter.remaining_item_count().to_string()
        })
        .await;
    } else {
        let (reconciler, updates) =
            ResourceWatchReconciler::<Pod, _, _>::new(source, WatchableCollection::<Pod>::new());
        tokio::spawn(reconciler.run(cancel.clone()));
        print_updates(updates, &cancel, render_pods).await;
    }

    Ok(())
}

async fn print_updates<St, F>(
    mut updates: watch::Receiver<St>,
    cancel: &CancellationToken,
    render: F,
) where
    F: Fn(&St) -> String,
{
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let output = render(&*updates.borrow_and_update());
                println!("{output}");
            }
        }
    }
    cancel.cancel();
}

fn render_pods(pods: &WatchableCollection<Pod>) -> String {
    let mut out = format!(
        "--- {} pods (resourceVersion {})",
        pods.len(),
        pods.metadata().resource_version
    );
    for pod in pods.items() {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Unknown");
        let state = if pod.metadata.deletion_timestamp.is_some() {
            "Terminating"
        } else {
            phase
        };
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or("-");
        out.push_str(&format!(
            "\n{:<20} {:<48} {:<12} {}",
            pod.namespace().unwrap_or_default(),
            pod.name_any(),
            state,
            node
        ));
    }
    out
}
