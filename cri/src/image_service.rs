//! CRI ImageService implementation.
//!
//! Image calls route by reference prefix rather than runtime handler.

use std::collections::HashMap;

use futures::future::try_join_all;
use tonic::{Request, Response, Status};

use multicri_core::api::image_service_server::ImageService;
use multicri_core::api::*;

use crate::error::cri_error_to_status;
use crate::remote::Route;
use crate::service::CriService;

fn image_spec(spec: &Option<ImageSpec>) -> Result<&str, Status> {
    spec.as_ref()
        .map(|spec| spec.image.as_str())
        .ok_or_else(|| Status::invalid_argument("image spec required"))
}

/// Request with the routing prefix removed from its image reference.
fn with_image(spec: Option<ImageSpec>, image: &str) -> Option<ImageSpec> {
    Some(ImageSpec {
        image: image.to_string(),
        ..spec.unwrap_or_default()
    })
}

#[tonic::async_trait]
impl ImageService for CriService {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let req = request.into_inner();

        let mut local = self.images.list(req.filter.as_ref());
        self.adapter
            .list_images(&mut local)
            .await
            .map_err(cri_error_to_status)?;

        let mut images: Vec<Image> = local.iter().map(|image| image.to_image()).collect();
        let remote = try_join_all(self.router.remotes().map(|remote| {
            let req = req.clone();
            async move { remote.image().list_images(req).await }
        }))
        .await?;
        images.extend(remote.into_iter().flat_map(|r| r.into_inner().images));

        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let mut req = request.into_inner();
        let reference = image_spec(&req.image)?.to_string();

        let (route, image_ref) = self.router.resolve_image(&reference);
        if let Route::Remote(remote) = route {
            req.image = with_image(req.image.take(), image_ref);
            return remote.image().image_status(req).await;
        }

        let mut image = match self.images.get(image_ref) {
            Ok(image) => image,
            Err(_) => return Ok(Response::new(ImageStatusResponse::default())),
        };
        self.adapter
            .image_status(&mut image)
            .await
            .map_err(cri_error_to_status)?;

        Ok(Response::new(ImageStatusResponse {
            image: Some(image.to_image()),
            info: HashMap::new(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let mut req = request.into_inner();
        let reference = image_spec(&req.image)?.to_string();

        tracing::info!(image = %reference, "CRI PullImage");

        let (route, image_ref) = self.router.resolve_image(&reference);
        if let Route::Remote(remote) = route {
            req.image = with_image(req.image.take(), image_ref);
            return remote.image().pull_image(req).await;
        }

        let mut image = self.images.create_metadata(image_ref, req.auth.as_ref());
        image.resolve_reference().map_err(cri_error_to_status)?;
        self.images.add(image.clone());

        if let Err(e) = self.adapter.pull_image(&mut image).await {
            tracing::warn!(image = %reference, error = %e, "Image pull failed");
            self.images.remove(&image.id);
            return Err(cri_error_to_status(e));
        }

        let image_ref = image.remote_path.clone();
        self.images.update(image);
        tracing::info!(image = %reference, image_ref = %image_ref, "Image pulled");

        Ok(Response::new(PullImageResponse { image_ref }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let mut req = request.into_inner();
        let reference = image_spec(&req.image)?.to_string();

        tracing::info!(image = %reference, "CRI RemoveImage");

        let (route, image_ref) = self.router.resolve_image(&reference);
        if let Route::Remote(remote) = route {
            req.image = with_image(req.image.take(), image_ref);
            return remote.image().remove_image(req).await;
        }

        let mut image = self.images.get(image_ref).map_err(cri_error_to_status)?;
        self.adapter
            .remove_image(&mut image)
            .await
            .map_err(cri_error_to_status)?;
        self.images.remove(&image.id);

        Ok(Response::new(RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        if let Some(remote) = self.router.default_remote() {
            return remote.image().image_fs_info(request.into_inner()).await;
        }

        let response = self
            .adapter
            .image_fs_info(&self.images.all())
            .await
            .map_err(cri_error_to_status)?;
        Ok(Response::new(response))
    }
}
